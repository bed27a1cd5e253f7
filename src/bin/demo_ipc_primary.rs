// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scenario 2/3 of the end-to-end walkthrough, primary half: bind the IPC
// control socket, accept secondaries, and periodically drain whatever
// output channels they've created. Run `demo_ipc_secondary` against the
// same namespace from another process (or another terminal) to see a
// round trip.

use std::time::Duration;

use jbpf_io_rt::config::IoConfig;
use jbpf_io_rt::ctx::IoCtx;

fn main() {
    env_logger::init();

    let config = IoConfig::ipc_primary("unix://ctl", 1 << 24).with_namespace("demo_ipc");
    let ctx = IoCtx::bootstrap(config).expect("bootstrap ipc primary");

    println!("ipc primary listening; ctrl-c to stop");
    loop {
        let n = ctx.drain_outputs(|_channel, stream_id, payload| {
            println!("recv stream_id={stream_id:?} {} bytes", payload.len());
        });
        if n > 0 {
            println!("drained {n} elements this tick");
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
