// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Standalone lifecycle-management request server: accepts codeletset
// load/unload requests on a UNIX socket and logs them. A real embedder
// would wire `LcmCallbacks` into its own codelet loader; this demo just
// echoes what it was asked to do.

use std::sync::Arc;

use jbpf_io_rt::lcm::{LcmCallbacks, LcmServer};

struct LoggingCallbacks;

impl LcmCallbacks for LoggingCallbacks {
    fn load(&self, codeletset_name: &str, payload: &[u8]) -> Result<(), String> {
        println!("load request: {codeletset_name} ({} bytes)", payload.len());
        Ok(())
    }

    fn unload(&self, codeletset_name: &str, payload: &[u8]) -> Result<(), String> {
        println!("unload request: {codeletset_name} ({} bytes)", payload.len());
        Ok(())
    }
}

fn main() {
    env_logger::init();

    let run_path = std::env::var("JBPF_RUN_PATH").unwrap_or_else(|_| "/tmp/jbpf".to_string());
    let path = std::path::PathBuf::from(run_path).join("jbpf").join("lcm.sock");

    let server = Arc::new(LcmServer::bind(&path, LoggingCallbacks).expect("bind lcm socket"));
    println!("lcm server listening on {}", path.display());

    let handle = jbpf_io_rt::lcm::spawn(server.clone());
    ctrlc_stop(server);
    handle.join().expect("lcm server thread");
}

/// Install a SIGINT handler that flips the server's `running` flag so
/// `serve`'s poll loop exits within its next 1s `select` tick.
fn ctrlc_stop(server: Arc<LcmServer<LoggingCallbacks>>) {
    static SERVER_FLAG: std::sync::OnceLock<std::sync::Arc<std::sync::atomic::AtomicBool>> = std::sync::OnceLock::new();
    let _ = SERVER_FLAG.set(server.running_flag());
    extern "C" fn handler(_sig: i32) {
        // Safety: only ever touches the atomic already stored above.
        if let Some(flag) = SERVER_FLAG.get() {
            flag.store(false, std::sync::atomic::Ordering::Release);
        }
    }
    unsafe { libc::signal(libc::SIGINT, handler as usize) };
}
