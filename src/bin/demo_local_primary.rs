// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scenario 1 of the end-to-end walkthrough: a single process creates an
// output channel, reserves and submits a few elements, then drains them
// back through the registry without any IPC involved.

use jbpf_io_rt::channel::Direction;
use jbpf_io_rt::config::IoConfig;
use jbpf_io_rt::ctx::IoCtx;
use jbpf_io_rt::stream_id::StreamId;

fn main() {
    env_logger::init();

    let config = IoConfig::local_primary(1 << 24).with_namespace("demo_local_primary");
    let ctx = IoCtx::bootstrap(config).expect("bootstrap local primary");

    let stream_id = StreamId::from_bytes(*b"demo_output_chan");
    ctx.create_channel(Direction::Output, stream_id, 0, 64, 32, None).expect("create output channel");

    for i in 0..8u32 {
        ctx.find_channel(Direction::Output, &stream_id, |channel| {
            channel.enqueue(|buf| buf[..4].copy_from_slice(&i.to_le_bytes())).expect("enqueue");
        });
    }

    let mut received = Vec::new();
    ctx.drain_outputs(|_channel, _stream_id, payload| {
        received.push(u32::from_le_bytes(payload[..4].try_into().unwrap()));
    });

    println!("drained {} elements: {received:?}", received.len());
}
