// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Latency of the per-channel reserve/submit/dequeue path (§4.3), the
// operation the hot codelet data plane calls on every message.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use jbpf_io_rt::heap::Heap;
use jbpf_io_rt::ioqueue::Queue;
use jbpf_io_rt::mempool::MempoolKind;
use jbpf_io_rt::thread_reg::ThreadRegistrationGuard;

fn with_heap<F: FnOnce(&Heap)>(len: usize, f: F) {
    let _t = ThreadRegistrationGuard::new().unwrap();
    let mut buf = vec![0u8; len];
    let heap = unsafe { Heap::new(buf.as_mut_ptr(), len) }.unwrap();
    f(&heap);
}

fn bench_reserve_submit_dequeue(c: &mut Criterion) {
    with_heap(1 << 24, |heap| {
        let queue = unsafe { &*Queue::create(heap, MempoolKind::Sp, 4096, 256).unwrap() };
        c.bench_function("queue_reserve_submit_dequeue_256b", |b| {
            b.iter(|| {
                queue.enqueue(|buf| buf.fill(0xAB)).expect("queue not full within one bench iteration");
                let ptr = queue.dequeue().expect("element just submitted");
                black_box(unsafe { std::slice::from_raw_parts(ptr, 256) });
                queue.finish(ptr);
            });
        });
    });
}

fn bench_drain_batch(c: &mut Criterion) {
    with_heap(1 << 24, |heap| {
        let queue = unsafe { &*Queue::create(heap, MempoolKind::Mp, 4096, 64).unwrap() };
        c.bench_function("queue_drain_1000_elements", |b| {
            b.iter(|| {
                for _ in 0..1000 {
                    queue.enqueue(|buf| buf.fill(0x01)).expect("queue not full within one bench iteration");
                }
                let n = queue.drain(|payload| {
                    black_box(payload);
                });
                assert_eq!(n, 1000);
            });
        });
    });
}

criterion_group!(benches, bench_reserve_submit_dequeue, bench_drain_batch);
criterion_main!(benches);
