// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lifecycle-management (LCM) request socket (§4.7), grounded in
// jbpf_lcm_ipc.c's `jbpf_lcm_ipc_server_start` select loop. A UNIX-only
// stream socket, separate from the IPC control plane in `ipc/`, carrying
// fixed-size codeletset load/unload requests dispatched to host-supplied
// callbacks.
//
// The load/unload request payloads themselves (`codeletset_load_req`,
// `codeletset_unload_req`) are named but left opaque by §1/§6 — they are
// the eBPF loader's schema, an external collaborator this crate does
// not define. Here they are carried as a bounded opaque byte blob the
// callback is handed verbatim; the crate only owns the envelope:
// message-type tag, a bounded name, the opaque blob, and the
// success/failure response with a bounded ASCII error string.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{IoError, Result};

/// Block on `select` for up to one second waiting for the listener fd to
/// become readable. Returns `true` if a connection is ready to `accept`,
/// `false` on timeout. Matches §5's "1 s timeout" cancellation idiom.
fn wait_readable_1s(fd: std::os::fd::RawFd) -> bool {
    unsafe {
        let mut read_fds: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut read_fds);
        libc::FD_SET(fd, &mut read_fds);
        let mut tv = libc::timeval { tv_sec: 1, tv_usec: 0 };
        let ready = libc::select(fd + 1, &mut read_fds, std::ptr::null_mut(), std::ptr::null_mut(), &mut tv);
        ready > 0
    }
}

/// Matches `JBPF_LCM_IPC_REQ_BACKLOG`.
pub const REQ_BACKLOG: i32 = 16;
/// Bound on the opaque codeletset request payload carried in one frame.
pub const MAX_REQ_PAYLOAD: usize = 4096;
/// Bound on a bounded-ASCII error string in a response.
pub const MAX_ERR_MSG: usize = 256;

const TAG_LOAD: u32 = 1;
const TAG_UNLOAD: u32 = 2;

const REQ_FRAME_SIZE: usize = 4 + 4 + 64 + 4 + MAX_REQ_PAYLOAD;
const RESP_FRAME_SIZE: usize = 4 + MAX_ERR_MSG;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

/// One codeletset load or unload request as received off the wire.
#[derive(Debug, Clone)]
pub enum LcmRequest {
    Load { codeletset_name: String, payload: Vec<u8> },
    Unload { codeletset_name: String, payload: Vec<u8> },
}

impl LcmRequest {
    fn encode(&self) -> [u8; REQ_FRAME_SIZE] {
        let mut buf = [0u8; REQ_FRAME_SIZE];
        let (tag, name, payload) = match self {
            LcmRequest::Load { codeletset_name, payload } => (TAG_LOAD, codeletset_name, payload),
            LcmRequest::Unload { codeletset_name, payload } => (TAG_UNLOAD, codeletset_name, payload),
        };
        buf[0..4].copy_from_slice(&tag.to_le_bytes());
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(63);
        buf[4..4 + n].copy_from_slice(&name_bytes[..n]);
        let plen = payload.len().min(MAX_REQ_PAYLOAD);
        buf[72..76].copy_from_slice(&(plen as u32).to_le_bytes());
        buf[76..76 + plen].copy_from_slice(&payload[..plen]);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQ_FRAME_SIZE {
            return Err(IoError::SerdeFailure("short lcm request frame"));
        }
        let tag = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let name_raw = &buf[4..68];
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let codeletset_name = String::from_utf8_lossy(&name_raw[..name_end]).into_owned();
        let plen = u32::from_le_bytes(buf[72..76].try_into().unwrap()) as usize;
        let plen = plen.min(MAX_REQ_PAYLOAD);
        let payload = buf[76..76 + plen].to_vec();
        match tag {
            TAG_LOAD => Ok(LcmRequest::Load { codeletset_name, payload }),
            TAG_UNLOAD => Ok(LcmRequest::Unload { codeletset_name, payload }),
            _ => Err(IoError::SerdeFailure("unrecognized lcm request tag")),
        }
    }
}

struct LcmResponse {
    outcome: Outcome,
    err_msg: String,
}

impl LcmResponse {
    fn encode(&self) -> [u8; RESP_FRAME_SIZE] {
        let mut buf = [0u8; RESP_FRAME_SIZE];
        let code: u32 = match self.outcome {
            Outcome::Success => 0,
            Outcome::Fail => 1,
        };
        buf[0..4].copy_from_slice(&code.to_le_bytes());
        let msg = self.err_msg.as_bytes();
        let n = msg.len().min(MAX_ERR_MSG - 1);
        buf[4..4 + n].copy_from_slice(&msg[..n]);
        buf
    }
}

/// Host-supplied dispatch callbacks: `Ok(())` maps to `Outcome::Success`,
/// `Err(message)` maps to `Outcome::Fail` with that message bounded to
/// `MAX_ERR_MSG` bytes.
pub trait LcmCallbacks: Send + Sync {
    fn load(&self, codeletset_name: &str, payload: &[u8]) -> std::result::Result<(), String>;
    fn unload(&self, codeletset_name: &str, payload: &[u8]) -> std::result::Result<(), String>;
}

/// The LCM request server: one UNIX listener, one dedicated thread
/// running `serve`, stopped by the same `is_running`-atomic-plus-1s-poll
/// idiom the IPC control thread uses (§5 "Cancellation and timeouts").
pub struct LcmServer<C: LcmCallbacks> {
    listener: UnixListener,
    callbacks: C,
    running: Arc<AtomicBool>,
}

impl<C: LcmCallbacks> LcmServer<C> {
    pub fn bind(path: &Path, callbacks: C) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(IoError::Io)?;
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(IoError::Io)?;
        log::info!("lcm: server listening on {}", path.display());
        Ok(Self { listener, callbacks, running: Arc::new(AtomicBool::new(true)) })
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Run the accept loop on the calling thread. Blocks in `select` with
    /// a 1 s timeout (so `stop` is observed promptly) until `stop` is
    /// called. Malformed or short requests close the client without a
    /// reply, per §4.7.
    pub fn serve(&self) {
        let fd = self.listener.as_raw_fd();
        while self.running.load(Ordering::Acquire) {
            if !wait_readable_1s(fd) {
                continue;
            }
            match self.listener.accept() {
                Ok((stream, _addr)) => self.handle_client(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::error!("lcm: accept failed: {e}");
                    break;
                }
            }
        }
        log::info!("lcm: server loop exiting");
    }

    fn handle_client(&self, mut stream: UnixStream) {
        let _ = stream.set_nonblocking(false);
        let mut buf = vec![0u8; REQ_FRAME_SIZE];
        if let Err(e) = stream.read_exact(&mut buf) {
            log::warn!("lcm: malformed/short request, closing connection without reply: {e}");
            return;
        }
        let req = match LcmRequest::decode(&buf) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("lcm: failed to decode request, closing connection without reply: {e}");
                return;
            }
        };
        let result = match &req {
            LcmRequest::Load { codeletset_name, payload } => self.callbacks.load(codeletset_name, payload),
            LcmRequest::Unload { codeletset_name, payload } => self.callbacks.unload(codeletset_name, payload),
        };
        let resp = match result {
            Ok(()) => LcmResponse { outcome: Outcome::Success, err_msg: String::new() },
            Err(msg) => {
                log::warn!("lcm: request failed: {msg}");
                LcmResponse { outcome: Outcome::Fail, err_msg: msg }
            }
        };
        if let Err(e) = stream.write_all(&resp.encode()) {
            log::warn!("lcm: failed to send response: {e}");
        }
    }
}

/// Send one request and block for the response. Used by the LCM client
/// side (the LCM CLI tool this crate does not implement, but its
/// transport is this function).
pub fn send_request(path: &Path, req: &LcmRequest) -> Result<std::result::Result<(), String>> {
    let mut stream = UnixStream::connect(path).map_err(IoError::Io)?;
    stream.write_all(&req.encode()).map_err(IoError::Io)?;
    let mut buf = vec![0u8; RESP_FRAME_SIZE];
    stream.read_exact(&mut buf).map_err(IoError::Io)?;
    let code = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if code == 0 {
        return Ok(Ok(()));
    }
    let raw = &buf[4..4 + MAX_ERR_MSG];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(Err(String::from_utf8_lossy(&raw[..end]).into_owned()))
}

pub fn spawn<C: LcmCallbacks + 'static>(server: Arc<LcmServer<C>>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || server.serve())
}

pub fn socket_path(run_path: &Path, namespace: &str, name: &str) -> PathBuf {
    run_path.join(namespace).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingCallbacks {
        loads: Mutex<Vec<String>>,
        unloads: Mutex<Vec<String>>,
        fail_loads: bool,
    }

    impl LcmCallbacks for RecordingCallbacks {
        fn load(&self, codeletset_name: &str, _payload: &[u8]) -> std::result::Result<(), String> {
            self.loads.lock().unwrap().push(codeletset_name.to_string());
            if self.fail_loads { Err("load rejected".to_string()) } else { Ok(()) }
        }
        fn unload(&self, codeletset_name: &str, _payload: &[u8]) -> std::result::Result<(), String> {
            self.unloads.lock().unwrap().push(codeletset_name.to_string());
            Ok(())
        }
    }

    fn unique_socket() -> PathBuf {
        let pid = std::process::id();
        let tag = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("jbpf_lcm_test_{pid}_{tag}.sock"))
    }

    #[test]
    fn load_request_round_trips_and_dispatches_to_callback() {
        let path = unique_socket();
        let callbacks = RecordingCallbacks { loads: Mutex::new(Vec::new()), unloads: Mutex::new(Vec::new()), fail_loads: false };
        let server = Arc::new(LcmServer::bind(&path, callbacks).unwrap());
        let handle = crate::lcm::spawn(server.clone());

        let req = LcmRequest::Load { codeletset_name: "cs1".to_string(), payload: vec![1, 2, 3] };
        let result = send_request(&path, &req).unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(server.callbacks.loads.lock().unwrap().as_slice(), &["cs1".to_string()]);

        server.stop();
        handle.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_load_reports_bounded_error_message() {
        let path = unique_socket();
        let callbacks = RecordingCallbacks { loads: Mutex::new(Vec::new()), unloads: Mutex::new(Vec::new()), fail_loads: true };
        let server = Arc::new(LcmServer::bind(&path, callbacks).unwrap());
        let handle = crate::lcm::spawn(server.clone());

        let req = LcmRequest::Load { codeletset_name: "cs2".to_string(), payload: Vec::new() };
        let result = send_request(&path, &req).unwrap();
        assert_eq!(result, Err("load rejected".to_string()));

        server.stop();
        handle.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_request_closes_connection_without_reply() {
        let path = unique_socket();
        let callbacks = RecordingCallbacks { loads: Mutex::new(Vec::new()), unloads: Mutex::new(Vec::new()), fail_loads: false };
        let server = Arc::new(LcmServer::bind(&path, callbacks).unwrap());
        let handle = crate::lcm::spawn(server.clone());

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(&[0u8; 4]).unwrap(); // far shorter than REQ_FRAME_SIZE
        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "server must close without replying to a short frame");

        server.stop();
        handle.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
