// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-channel element queue (§4.3), layered on a `Mempool` plus a data
// ring of the same capacity. Two usage shapes share this one type:
//
// - Output channels: a single producer thread calls `reserve`/`submit`,
//   the registry owner calls `dequeue`/`drain` from the consuming side.
//   Backed by an `Sp` mempool and effectively MPSC from the data ring's
//   point of view (the reserve-slot table still allows multiple
//   producer threads as long as each commits before reusing its slot).
// - Input/control channels: many threads may `reserve`/`submit`
//   concurrently (`Mp` mempool), and a single reader dequeues.
//
// `reserve` hands back a fixed per-thread slot (`thread_reg::MAX_THREADS`
// wide) holding the in-flight mbuf, so a thread that reserves and then
// crashes (or simply never submits) cannot corrupt another thread's
// in-flight allocation; `release`/`release_all` are idempotent, matching
// the upstream queue's redundant-call tolerance.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::mempool::{Mempool, MempoolKind};
use crate::ring::Ring;
use crate::thread_reg::{get_thread_id, MAX_THREADS};

pub struct Queue {
    pool: *mut Mempool,
    data_ring: Ring,
    elem_size: usize,
    num_elems: usize,
    reserved: [AtomicPtr<u8>; MAX_THREADS],
}

unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Create a queue of `n_elems` elements of `elem_size` bytes, carved
    /// out of `heap`. `kind` selects the mempool's intended concurrency
    /// shape (`Sp` for an output channel's producer side, `Mp` for an
    /// input channel's).
    pub fn create(heap: &Heap, kind: MempoolKind, n_elems: u32, elem_size: usize) -> Result<*mut Queue> {
        // §4.3: sized `max_entries + MAX_THREADS` so every registered
        // thread can hold one in-flight reservation without starving the
        // `n_elems` budget the caller actually asked for.
        let pool_elems = n_elems.saturating_add(MAX_THREADS as u32);
        let pool = Mempool::create(heap, kind, pool_elems, elem_size)?;
        let num_elems = unsafe { (*pool).capacity() };
        let ring_bytes = Ring::slots_bytes(num_elems + 1);
        let ring_mem = heap.calloc(1, ring_bytes)?;
        let queue_mem = heap.calloc(1, std::mem::size_of::<Queue>())? as *mut Queue;
        unsafe {
            let data_ring = Ring::new_in(ring_mem, num_elems + 1);
            ptr::write(
                queue_mem,
                Queue {
                    pool,
                    data_ring,
                    elem_size,
                    num_elems,
                    reserved: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
                },
            );
        }
        Ok(queue_mem)
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn num_elems(&self) -> usize {
        self.num_elems
    }

    fn pool(&self) -> &Mempool {
        unsafe { &*self.pool }
    }

    fn slot(&self) -> Result<&AtomicPtr<u8>> {
        let tid = get_thread_id().ok_or(IoError::ThreadNotRegistered)? as usize;
        Ok(&self.reserved[tid])
    }

    /// Reserve one mbuf for the calling thread, returning a pointer the
    /// caller may write `elem_size` bytes into. A thread may hold at most
    /// one reservation at a time; calling `reserve` again before an
    /// intervening `submit`/`release` is idempotent and returns the same
    /// pointer (§4.3).
    pub fn reserve(&self) -> Result<*mut u8> {
        let slot = self.slot()?;
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(existing);
        }
        let buf = self.pool().alloc().ok_or(IoError::PoolExhausted)?;
        slot.store(buf, Ordering::Release);
        Ok(buf)
    }

    /// Clear the calling thread's reservation without publishing it,
    /// returning the mbuf to the pool. A no-op if there is no
    /// reservation outstanding.
    pub fn release(&self) -> Result<()> {
        let slot = self.slot()?;
        let buf = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !buf.is_null() {
            unsafe { self.pool().free_from_data_ptr(buf, false) };
        }
        Ok(())
    }

    /// Release every thread's outstanding reservation. Used on channel
    /// teardown; safe to call even if nothing is reserved.
    pub fn release_all(&self) {
        for slot in &self.reserved {
            let buf = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !buf.is_null() {
                unsafe { self.pool().free_from_data_ptr(buf, false) };
            }
        }
    }

    /// Publish the calling thread's outstanding reservation onto the
    /// data ring. Fails with `ThreadNotRegistered` if there is no
    /// reservation, or `CapacityExceeded` if the data ring is (should
    /// never happen under correct use, since the ring has one slot per
    /// mbuf) momentarily full.
    pub fn submit(&self) -> Result<()> {
        let slot = self.slot()?;
        let buf = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if buf.is_null() {
            return Err(IoError::ThreadNotRegistered);
        }
        if !self.data_ring.push(buf as *mut ()) {
            // Ring briefly appeared full under contention: return the mbuf.
            unsafe { self.pool().free_from_data_ptr(buf, false) };
            return Err(IoError::CapacityExceeded);
        }
        Ok(())
    }

    /// Reserve, let the caller fill the element, then submit in one call.
    pub fn enqueue(&self, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        let buf = self.reserve()?;
        let slice = unsafe { std::slice::from_raw_parts_mut(buf, self.elem_size) };
        fill(slice);
        self.submit()
    }

    /// Dequeue one element's data pointer without freeing the backing
    /// mbuf — the caller owns it until it calls `Mempool::free` (exposed
    /// here as `finish`).
    pub fn dequeue(&self) -> Option<*mut u8> {
        self.data_ring.pop().map(|p| p as *mut u8)
    }

    /// Return a dequeued element's mbuf to the pool once the caller is
    /// done reading it.
    pub fn finish(&self, data_ptr: *mut u8) {
        unsafe { self.pool().free_from_data_ptr(data_ptr, false) };
    }

    /// Drain every currently queued element, calling `f` with each
    /// payload slice and then returning its mbuf to the pool. Stops once
    /// the ring is empty; does not block for more to arrive.
    pub fn drain(&self, mut f: impl FnMut(&[u8])) -> usize {
        let mut n = 0;
        while let Some(ptr) = self.dequeue() {
            let slice = unsafe { std::slice::from_raw_parts(ptr, self.elem_size) };
            f(slice);
            self.finish(ptr);
            n += 1;
        }
        n
    }

    pub fn destroy(&self) {
        self.release_all();
        self.pool().destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_reg::ThreadRegistrationGuard;

    fn with_heap<F: FnOnce(&Heap)>(len: usize, f: F) {
        let _t = ThreadRegistrationGuard::new().unwrap();
        let mut buf = vec![0u8; len];
        let heap = unsafe { Heap::new(buf.as_mut_ptr(), len) }.unwrap();
        f(&heap);
    }

    #[test]
    fn enqueue_dequeue_round_trips_payload() {
        with_heap(1 << 16, |heap| {
            let q = Queue::create(heap, MempoolKind::Sp, 7, 8).unwrap();
            let q = unsafe { &*q };
            q.enqueue(|buf| buf[..5].copy_from_slice(b"hello")).unwrap();
            let ptr = q.dequeue().expect("one element queued");
            let slice = unsafe { std::slice::from_raw_parts(ptr, q.elem_size()) };
            assert_eq!(&slice[..5], b"hello");
            q.finish(ptr);
        });
    }

    #[test]
    fn reserve_without_submit_is_released_by_release_all() {
        with_heap(1 << 16, |heap| {
            let q = Queue::create(heap, MempoolKind::Sp, 3, 8).unwrap();
            let q = unsafe { &*q };
            q.reserve().unwrap();
            assert!(q.dequeue().is_none());
            q.release_all();
            assert!(q.reserve().is_ok());
        });
    }

    #[test]
    fn reserve_without_intervening_submit_or_release_is_idempotent() {
        with_heap(1 << 16, |heap| {
            let q = Queue::create(heap, MempoolKind::Sp, 7, 8).unwrap();
            let q = unsafe { &*q };
            let a = q.reserve().unwrap();
            let b = q.reserve().unwrap();
            assert_eq!(a, b);
            q.release_all();
        });
    }

    #[test]
    fn release_all_is_idempotent() {
        with_heap(1 << 16, |heap| {
            let q = Queue::create(heap, MempoolKind::Sp, 3, 8).unwrap();
            let q = unsafe { &*q };
            q.release_all();
            q.release_all();
        });
    }

    #[test]
    fn drain_consumes_everything_then_stops() {
        with_heap(1 << 16, |heap| {
            let q = Queue::create(heap, MempoolKind::Mp, 7, 4).unwrap();
            let q = unsafe { &*q };
            for i in 0..4u8 {
                q.enqueue(|buf| buf[0] = i).unwrap();
            }
            let mut seen = Vec::new();
            let n = q.drain(|payload| seen.push(payload[0]));
            assert_eq!(n, 4);
            assert_eq!(seen, vec![0, 1, 2, 3]);
            assert_eq!(q.drain(|_| ()), 0);
        });
    }

    #[test]
    fn pool_exhaustion_under_concurrent_producers_is_reported_not_panicked() {
        with_heap(1 << 20, |heap| {
            let q = Queue::create(heap, MempoolKind::Mp, 31, 8).unwrap();
            let addr = q as usize;
            let results: Vec<bool> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(move || {
                            let _t = ThreadRegistrationGuard::new().unwrap();
                            let q = unsafe { &*(addr as *const Queue) };
                            let mut ok = true;
                            for _ in 0..20 {
                                ok &= q.enqueue(|buf| buf[0] = 1).is_ok();
                            }
                            ok
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            // 80 attempts against a pool sized `31 + MAX_THREADS`: some must
            // fail once the reservation headroom is exhausted too, none
            // must panic.
            assert!(results.iter().any(|ok| !ok));
            let q = unsafe { &*q };
            let cap = q.pool().capacity();
            assert!(q.drain(|_| ()) <= cap);
        });
    }
}
