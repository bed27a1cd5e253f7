// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide thread-id bitmap. Every thread that reserves, submits,
// releases or looks up a channel must hold one of MAX_THREADS small
// integer ids, stored in TLS and used to index per-thread epoch records
// and queue reservation slots.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of threads that may be registered at once.
pub const MAX_THREADS: usize = 32;

static THREAD_BITMAP: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<u16>> = const { Cell::new(None) };
}

/// Register the calling thread, allocating the first clear bit in the
/// process-wide bitmap. Calling this twice from the same thread is a
/// no-op that returns the same id (idempotent per §8).
///
/// Returns `None` if all `MAX_THREADS` ids are taken.
pub fn register_thread() -> Option<u16> {
    if let Some(id) = THREAD_ID.with(|c| c.get()) {
        return Some(id);
    }
    loop {
        let bitmap = THREAD_BITMAP.load(Ordering::Relaxed);
        let free = (!bitmap).trailing_zeros();
        if free as usize >= MAX_THREADS {
            return None;
        }
        let mask = 1u32 << free;
        if THREAD_BITMAP.compare_exchange_weak(bitmap, bitmap | mask, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
            let id = free as u16;
            THREAD_ID.with(|c| c.set(Some(id)));
            return Some(id);
        }
        std::hint::spin_loop();
    }
}

/// Clear the calling thread's id, freeing its bit for reuse. A no-op if
/// the thread was never registered.
pub fn remove_thread() {
    if let Some(id) = THREAD_ID.with(|c| c.take()) {
        THREAD_BITMAP.fetch_and(!(1u32 << id), Ordering::AcqRel);
    }
}

/// Return the calling thread's id, auto-registering on first call.
/// Returns `None` only when the bitmap is exhausted.
pub fn get_thread_id() -> Option<u16> {
    if let Some(id) = THREAD_ID.with(|c| c.get()) {
        return Some(id);
    }
    register_thread()
}

/// RAII guard that registers the calling thread on construction and
/// removes it on drop. Tests use this for isolation between cases that
/// share the process-wide bitmap.
pub struct ThreadRegistrationGuard {
    pub id: u16,
}

impl ThreadRegistrationGuard {
    pub fn new() -> Option<Self> {
        register_thread().map(|id| Self { id })
    }
}

impl Drop for ThreadRegistrationGuard {
    fn drop(&mut self) {
        remove_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let a = register_thread().unwrap();
        let b = register_thread().unwrap();
        assert_eq!(a, b);
        remove_thread();
    }

    #[test]
    fn get_thread_id_auto_registers() {
        remove_thread();
        let id = get_thread_id().unwrap();
        assert_eq!(get_thread_id().unwrap(), id);
        remove_thread();
    }

    #[test]
    fn remove_then_register_may_reuse_id() {
        let id = register_thread().unwrap();
        remove_thread();
        assert!(THREAD_ID.with(|c| c.get()).is_none());
        let _ = id;
    }

    #[test]
    fn exhausting_the_bitmap_returns_none() {
        // Block on a barrier so every worker holds its registration at the
        // same time, then each worker tears down its own before returning
        // (remove_thread must run on the owning thread).
        use std::sync::{Arc, Barrier};
        let n = MAX_THREADS + 4;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let got = register_thread().is_some();
                    barrier.wait();
                    remove_thread();
                    got
                })
            })
            .collect();
        let any_exhausted = handles.into_iter().map(|h| h.join().unwrap()).any(|got| !got);
        assert!(any_exhausted);
    }
}
