// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-element pool of reference-counted `mbuf`s (§4.2). Every mbuf and
// every ring this pool owns is carved out of a `Heap`, so a pool backing
// an IPC channel is visible byte-for-byte in both the primary and the
// secondary once their arenas are mapped at the same virtual address.
//
// Destruction follows the ring-marker protocol: `destroy()` swings the
// allocation ring over to an always-empty sentinel ring so no further
// `alloc` can succeed, then pushes a marker onto the free ring. The free
// ring is sized to hold exactly `num_elems` mbufs plus the one marker, so
// the push that brings it to that exact full count — whether that's
// `destroy()`'s own marker push (everything was already free) or a later
// `free_from_data_ptr`'s push (the last outstanding reference let go) —
// is the one that runs the physical teardown. Because `Heap` is a bump
// allocator that never reclaims individual blocks, "physical teardown"
// here means running the pool's own bookkeeping (marking it dead,
// poisoning the payload bytes) rather than handing memory back to an
// allocator: the bytes themselves are reclaimed only when the owning
// arena is dropped. See DESIGN.md for this as a recorded open-question
// decision.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::ring::Ring;

/// Whether a pool's free-ring is expected to see many concurrent
/// producers (`Mp`, used by input/IPC-inbound queues) or effectively one
/// (`Sp`, used by output queues). The underlying ring is MPMC-safe
/// either way; this only documents the intended usage per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolKind {
    Sp,
    Mp,
}

const ALIGN: usize = 16;

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[repr(C)]
struct MbufHeader {
    ref_cnt: AtomicUsize,
    pool: *mut Mempool,
}

pub struct Mempool {
    kind: MempoolKind,
    element_size: usize,
    mbuf_size: usize,
    header_size: usize,
    num_elems: usize,
    data_base: *mut u8,
    ring: Ring,
    ring_destroy: Ring,
    alloc_ring: AtomicPtr<Ring>,
    marker: *mut u8,
    destroying: AtomicBool,
    destroyed: AtomicBool,
}

unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    /// Bytes `Heap::calloc` must provide for a pool of `n_elems` elements
    /// of `element_size` bytes: the `Mempool` struct itself, the mbuf
    /// array, both rings' slot arrays and the one-element marker.
    fn header_size() -> usize {
        align_up(std::mem::size_of::<MbufHeader>(), ALIGN)
    }

    /// Create a pool of at least `n_elems` elements (rounded so
    /// `num_elems + 1` is a power of two, per §4.2) carved out of `heap`.
    /// Returns a raw, heap-stable pointer: pools are explicitly destroyed
    /// via `Mempool::destroy`, not via Rust's `Drop`, matching the
    /// ring-marker teardown protocol.
    pub fn create(heap: &Heap, kind: MempoolKind, n_elems: u32, element_size: usize) -> Result<*mut Mempool> {
        if element_size == 0 {
            return Err(IoError::ArenaAllocFailed);
        }
        let num_elems = ((n_elems as usize) + 1).next_power_of_two() - 1;
        let header_size = Self::header_size();
        let mbuf_size = align_up(header_size + element_size, ALIGN);

        let data_base = heap.calloc(num_elems, mbuf_size)?;
        let ring_bytes = Ring::slots_bytes(num_elems + 1);
        let ring_mem = heap.calloc(1, ring_bytes)?;
        let ring_destroy_mem = heap.calloc(1, ring_bytes)?;
        let marker = heap.calloc(1, mbuf_size)?;

        let pool_mem = heap.calloc(1, std::mem::size_of::<Mempool>())? as *mut Mempool;
        unsafe {
            let ring = Ring::new_in(ring_mem, num_elems + 1);
            let ring_destroy = Ring::new_in(ring_destroy_mem, num_elems + 1);
            ptr::write(
                pool_mem,
                Mempool {
                    kind,
                    element_size,
                    mbuf_size,
                    header_size,
                    num_elems,
                    data_base,
                    ring,
                    ring_destroy,
                    alloc_ring: AtomicPtr::new(ptr::null_mut()),
                    marker,
                    destroying: AtomicBool::new(false),
                    destroyed: AtomicBool::new(false),
                },
            );
            (*pool_mem).alloc_ring.store(&mut (*pool_mem).ring as *mut Ring, Ordering::Release);

            let mut entry = data_base;
            for _ in 0..num_elems {
                let hdr = entry as *mut MbufHeader;
                ptr::write(hdr, MbufHeader { ref_cnt: AtomicUsize::new(0), pool: pool_mem });
                let pushed = (*pool_mem).ring.push(hdr as *mut ());
                debug_assert!(pushed, "freshly sized free ring must accept all num_elems entries");
                entry = entry.add(mbuf_size);
            }
        }
        log::info!("mempool: added {num_elems} elements of size {element_size} ({mbuf_size}-byte mbufs)");
        Ok(pool_mem)
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn capacity(&self) -> usize {
        self.num_elems
    }

    pub fn kind(&self) -> MempoolKind {
        self.kind
    }

    /// Current size of the live allocation ring (number of free mbufs).
    pub fn free_len(&self) -> usize {
        self.ring.len()
    }

    fn alloc_ring(&self) -> &Ring {
        unsafe { &*self.alloc_ring.load(Ordering::Acquire) }
    }

    /// Dequeue one mbuf and set `ref_cnt = 1`. Returns `None` if the pool
    /// is empty or being destroyed (the allocation ring has been swung to
    /// the always-empty destroy ring).
    pub fn alloc(&self) -> Option<*mut u8> {
        let hdr = self.alloc_ring().pop()? as *mut MbufHeader;
        unsafe {
            (*hdr).ref_cnt.store(1, Ordering::SeqCst);
            Some(Self::data_ptr(hdr, self.header_size))
        }
    }

    fn data_ptr(hdr: *mut MbufHeader, header_size: usize) -> *mut u8 {
        unsafe { (hdr as *mut u8).add(header_size) }
    }

    unsafe fn header_of(&self, data_ptr: *mut u8) -> *mut MbufHeader {
        data_ptr.sub(self.header_size) as *mut MbufHeader
    }

    /// Atomic increment of `ref_cnt`, recovering the mbuf header from its
    /// data pointer.
    ///
    /// # Safety
    /// `data_ptr` must be a live (not yet fully freed) data pointer
    /// previously returned by `alloc` on this pool.
    pub unsafe fn share_from_data_ptr(&self, data_ptr: *mut u8) -> *mut u8 {
        let hdr = self.header_of(data_ptr);
        (*hdr).ref_cnt.fetch_add(1, Ordering::SeqCst);
        data_ptr
    }

    /// Decrement `ref_cnt`; when it reaches zero, optionally zero the
    /// payload and return the mbuf to the free ring. The free ring has
    /// room for every mbuf plus the destroy marker and no more, so once
    /// destruction has begun, the push that brings the ring to that
    /// exact full count is the one that performs the pool's physical
    /// teardown — whether that push is this one or `destroy()`'s own
    /// marker push.
    ///
    /// # Safety
    /// `data_ptr` must be a live data pointer previously returned by
    /// `alloc` (or `share_from_data_ptr`) on this pool, not already freed
    /// down to zero references.
    pub unsafe fn free_from_data_ptr(&self, data_ptr: *mut u8, reset: bool) {
        let hdr = self.header_of(data_ptr);
        let prev = (*hdr).ref_cnt.fetch_sub(1, Ordering::SeqCst);
        if prev != 1 {
            return;
        }
        if reset {
            ptr::write_bytes(data_ptr, 0, self.element_size);
        }
        let pushed = self.ring.push(hdr as *mut ());
        debug_assert!(pushed, "free ring is sized for every mbuf plus the marker; it cannot be full here");
        if self.destroying.load(Ordering::Acquire) && self.ring.is_full() {
            self.complete_teardown();
        }
    }

    /// Swing the allocation ring to the (permanently empty) destroy ring,
    /// blocking further `alloc`s, then push the marker onto the free
    /// ring. If the free ring is now full — every mbuf was already
    /// free — the calling thread performs the teardown itself;
    /// otherwise the thread whose `free_from_data_ptr` call later brings
    /// the ring to that full count will.
    pub fn destroy(&self) {
        if self.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alloc_ring.store(&self.ring_destroy as *const Ring as *mut Ring, Ordering::Release);
        let pushed = self.ring.push(self.marker as *mut ());
        debug_assert!(pushed, "free ring always has room for the marker at the moment destroy begins");
        if self.ring.is_full() {
            self.complete_teardown();
        }
    }

    fn complete_teardown(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            log::info!("mempool: physical teardown ({} elements)", self.num_elems);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
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
    fn alloc_sets_ref_cnt_one_and_free_returns_to_ring() {
        with_heap(1 << 16, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Sp, 7, 8).unwrap();
            let pool = unsafe { &*pool };
            assert_eq!(pool.capacity(), 7);
            let a = pool.alloc().unwrap();
            assert_eq!(pool.free_len(), pool.capacity() - 1);
            unsafe { pool.free_from_data_ptr(a, false) };
            assert_eq!(pool.free_len(), pool.capacity());
        });
    }

    #[test]
    fn pool_of_n_allocates_n_times_then_fails() {
        with_heap(1 << 16, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Mp, 7, 4).unwrap();
            let pool = unsafe { &*pool };
            let mut bufs = Vec::new();
            for _ in 0..pool.capacity() {
                bufs.push(pool.alloc().expect("within capacity"));
            }
            assert!(pool.alloc().is_none());
            for b in bufs {
                unsafe { pool.free_from_data_ptr(b, false) };
            }
        });
    }

    #[test]
    fn share_keeps_mbuf_alive_across_one_free() {
        with_heap(1 << 16, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Sp, 3, 8).unwrap();
            let pool = unsafe { &*pool };
            let a = pool.alloc().unwrap();
            let shared = unsafe { pool.share_from_data_ptr(a) };
            assert_eq!(shared, a);
            unsafe { pool.free_from_data_ptr(a, false) };
            // still alive: one ref remains, so it must not be back on the ring.
            assert_eq!(pool.free_len(), pool.capacity() - 1);
            unsafe { pool.free_from_data_ptr(a, false) };
            assert_eq!(pool.free_len(), pool.capacity());
        });
    }

    #[test]
    fn destroy_when_all_free_tears_down_immediately() {
        with_heap(1 << 16, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Sp, 3, 8).unwrap();
            let pool = unsafe { &*pool };
            pool.destroy();
            assert!(pool.is_destroyed());
            assert!(pool.alloc().is_none());
        });
    }

    #[test]
    fn destroy_under_reference_defers_teardown_to_last_free() {
        with_heap(1 << 16, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Sp, 3, 8).unwrap();
            let pool = unsafe { &*pool };
            let a = pool.alloc().unwrap();
            let shared = unsafe { pool.share_from_data_ptr(a) };
            pool.destroy();
            assert!(!pool.is_destroyed());
            unsafe { pool.free_from_data_ptr(a, false) };
            assert!(!pool.is_destroyed());
            unsafe { pool.free_from_data_ptr(shared, false) };
            assert!(pool.is_destroyed());
        });
    }

    #[test]
    fn concurrent_alloc_free_leaves_pool_fully_reclaimed() {
        with_heap(1 << 20, |heap| {
            let pool = Mempool::create(heap, MempoolKind::Mp, 9999, 16).unwrap();
            let pool_addr = pool as usize;
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(move || {
                        let _t = ThreadRegistrationGuard::new().unwrap();
                        let pool = unsafe { &*(pool_addr as *const Mempool) };
                        for _ in 0..5000 {
                            let mut held = Vec::with_capacity(20);
                            for _ in 0..20 {
                                if let Some(b) = pool.alloc() {
                                    held.push(b);
                                }
                            }
                            for b in held {
                                unsafe { pool.free_from_data_ptr(b, false) };
                            }
                        }
                    });
                }
            });
            let pool = unsafe { &*pool };
            assert_eq!(pool.free_len(), pool.capacity());
            pool.destroy();
            assert!(pool.is_destroyed());
        });
    }
}
