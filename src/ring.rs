// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded lock-free ring of `*mut ()` slots, capacity a power of two.
// Used both as the mempool free/destroy rings (§4.2) and as the backing
// ring of an ioqueue (§4.3). MPMC by default; queues pick MPSC semantics
// on the producer or consumer side simply by having only one thread call
// the corresponding half — the ring itself does not distinguish.
//
// Slot state is a simple compare-and-swap on a tagged pointer: a null
// slot is empty, any other value is occupied. This trades the strict
// Vyukov-style sequence-number ring for something considerably simpler;
// it is sound under the mempool/queue usage pattern where in-flight
// items are bounded by the element count (the caller never pushes more
// items than the pool itself produced).
//
// A ring's slot array lives in one of two places: a private heap
// allocation (`Ring::new`, used by transient/test-only rings), or a
// caller-supplied byte range inside an arena (`Ring::new_in`, used by
// every mempool/ioqueue ring an `io_ctx` owns) so the slot array is the
// same memory in both processes once the arena is mapped at the same
// virtual address on each side of an IPC session.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub struct Ring {
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: *mut AtomicPtr<()>,
    owns_slots: bool,
}

impl Ring {
    /// Number of bytes `new_in` needs for a ring of at least `capacity`
    /// live slots (rounded up to the next power of two).
    pub fn slots_bytes(capacity: usize) -> usize {
        Self::rounded_capacity(capacity) * std::mem::size_of::<AtomicPtr<()>>()
    }

    fn rounded_capacity(capacity: usize) -> usize {
        capacity.max(1).next_power_of_two()
    }

    /// `capacity` is rounded up to the next power of two. The slot array
    /// is a private heap allocation, freed when the ring is dropped.
    pub fn new(capacity: usize) -> Self {
        let cap = Self::rounded_capacity(capacity);
        let boxed: Box<[AtomicPtr<()>]> =
            (0..cap).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        let slots = Box::into_raw(boxed) as *mut AtomicPtr<()>;
        Self { mask: cap - 1, head: AtomicUsize::new(0), tail: AtomicUsize::new(0), slots, owns_slots: true }
    }

    /// Build a ring whose slot array lives at `mem`, which must be valid
    /// for `Self::slots_bytes(capacity)` bytes and outlive the returned
    /// `Ring`. The ring never frees this memory; it is reclaimed when the
    /// owning arena/heap goes away.
    ///
    /// # Safety
    /// `mem` must be suitably aligned for `AtomicPtr<()>`, point to at
    /// least `slots_bytes(capacity)` bytes, and not be concurrently
    /// written by anything other than this ring's own `push`/`pop`.
    pub unsafe fn new_in(mem: *mut u8, capacity: usize) -> Self {
        let cap = Self::rounded_capacity(capacity);
        let slots = mem as *mut AtomicPtr<()>;
        for i in 0..cap {
            ptr::write(slots.add(i), AtomicPtr::new(ptr::null_mut()));
        }
        Self { mask: cap - 1, head: AtomicUsize::new(0), tail: AtomicUsize::new(0), slots, owns_slots: false }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn slot(&self, idx: usize) -> &AtomicPtr<()> {
        unsafe { &*self.slots.add(idx & self.mask) }
    }

    /// Attempt to enqueue `ptr` (must be non-null). Returns `false` if the
    /// ring is full.
    pub fn push(&self, ptr: *mut ()) -> bool {
        debug_assert!(!ptr.is_null());
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.capacity() {
                return false;
            }
            let slot = self.slot(tail);
            if slot.load(Ordering::Acquire).is_null()
                && self.tail.compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed).is_ok()
            {
                slot.store(ptr, Ordering::Release);
                return true;
            }
            std::hint::spin_loop();
        }
    }

    /// Attempt to dequeue one item. Returns `None` if the ring is empty.
    pub fn pop(&self) -> Option<*mut ()> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let slot = self.slot(head);
            let val = slot.load(Ordering::Acquire);
            if val.is_null() {
                // A push claimed this slot's index but has not stored yet.
                std::hint::spin_loop();
                continue;
            }
            if self.head.compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                slot.store(ptr::null_mut(), Ordering::Release);
                return Some(val);
            }
            std::hint::spin_loop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if self.owns_slots {
            unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(self.slots, self.capacity())));
            }
        }
    }
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let ring = Ring::new(4);
        let mut vals = [1i32, 2, 3];
        for v in &mut vals {
            assert!(ring.push(v as *mut i32 as *mut ()));
        }
        for v in &vals {
            assert_eq!(ring.pop(), Some(*v as *const i32 as *mut i32 as *mut ()));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn capacity_rounds_up_and_rejects_overflow() {
        let ring = Ring::new(3);
        assert_eq!(ring.capacity(), 4);
        let mut vals = [1i32, 2, 3, 4];
        for v in &mut vals {
            assert!(ring.push(v as *mut i32 as *mut ()));
        }
        let mut five = 5i32;
        assert!(!ring.push(&mut five as *mut i32 as *mut ()));
    }

    #[test]
    fn new_in_operates_over_caller_supplied_memory() {
        let bytes = Ring::slots_bytes(4);
        let mut buf = vec![0u8; bytes];
        let ring = unsafe { Ring::new_in(buf.as_mut_ptr(), 4) };
        let mut v = 7i32;
        assert!(ring.push(&mut v as *mut i32 as *mut ()));
        assert_eq!(ring.pop(), Some(&mut v as *mut i32 as *mut ()));
    }
}
