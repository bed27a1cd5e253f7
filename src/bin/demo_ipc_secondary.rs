// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scenario 2/3 of the end-to-end walkthrough, secondary half: connect to
// a running `demo_ipc_primary`, negotiate the shared arena, and drive
// the channel create/find/destroy control-plane RPCs. Run
// `demo_ipc_primary` first, in the same namespace.

use jbpf_io_rt::channel::Direction;
use jbpf_io_rt::config::IoConfig;
use jbpf_io_rt::ctx::IoCtx;
use jbpf_io_rt::stream_id::StreamId;

fn main() {
    env_logger::init();

    let config = IoConfig::ipc_secondary("unix://ctl", 1 << 24).with_namespace("demo_ipc");
    let ctx = IoCtx::bootstrap(config).expect("connect to ipc primary (is demo_ipc_primary running?)");

    let stream_id = StreamId::from_bytes(*b"demo_output_chan");
    let handle = ctx
        .create_remote_channel(Direction::Output, stream_id, 0, 64, 32)
        .expect("negotiate channel with primary");
    println!("primary assigned handle {}", handle.0);

    // This secondary also keeps its own local bookkeeping over the
    // negotiated shared heap, for any channel it wants to own entirely
    // on its own side without round-tripping every create through the
    // primary's control socket.
    ctx.create_channel(Direction::Output, stream_id, 0, 64, 32, None).expect("local mirror channel");
    for i in 0..4u32 {
        ctx.find_channel(Direction::Output, &stream_id, |channel| {
            channel.enqueue(|buf| buf[..4].copy_from_slice(&i.to_le_bytes())).expect("enqueue");
        });
    }
    let drained = ctx.drain_outputs(|_c, _id, _payload| {});
    println!("drained {drained} locally-queued elements");
}
