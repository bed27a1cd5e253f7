// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-thread epoch records used to defer reclamation of removed registry
// entries until no reader is still inside a critical section. One
// EpochList is shared per registry (channel registry, peer list); each
// registered thread owns exactly one slot, indexed by its thread id.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::thread_reg::{get_thread_id, MAX_THREADS};

const QUIESCENT: u64 = 0;

/// Epoch records for one registry. `enter`/`exit` bracket a read-side
/// critical section; `retire_barrier` blocks until every active reader
/// has observed an epoch strictly past `retired_at`.
pub struct EpochList {
    global: AtomicU64,
    readers: [AtomicU64; MAX_THREADS],
}

impl EpochList {
    pub const fn new() -> Self {
        const Z: AtomicU64 = AtomicU64::new(QUIESCENT);
        Self { global: AtomicU64::new(1), readers: [Z; MAX_THREADS] }
    }

    /// Mark the calling thread as having entered a read-side critical
    /// section. Returns a guard that exits on drop. Auto-registers the
    /// thread if needed.
    pub fn enter(&self) -> Option<EpochGuard<'_>> {
        let tid = get_thread_id()? as usize;
        let epoch = self.global.load(Ordering::Acquire);
        self.readers[tid].store(epoch, Ordering::Release);
        Some(EpochGuard { list: self, tid })
    }

    /// Bump the global epoch and return its new value. Call this once
    /// after removing an item from the registry, before retiring it.
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Block until every reader's recorded epoch is either quiescent or
    /// at/after `retired_at`, meaning no reader can still hold a
    /// reference acquired before the removal that produced `retired_at`.
    pub fn retire_barrier(&self, retired_at: u64) {
        let mut backoff = 0u32;
        loop {
            let all_clear = self.readers.iter().all(|r| {
                let e = r.load(Ordering::Acquire);
                e == QUIESCENT || e >= retired_at
            });
            if all_clear {
                return;
            }
            crate::spin_lock::adaptive_yield_pub(&mut backoff);
        }
    }
}

impl Default for EpochList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EpochGuard<'a> {
    list: &'a EpochList,
    tid: usize,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.list.readers[self.tid].store(QUIESCENT, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_reg::ThreadRegistrationGuard;

    #[test]
    fn retire_barrier_returns_immediately_with_no_active_readers() {
        let list = EpochList::new();
        let epoch = list.advance();
        list.retire_barrier(epoch);
    }

    #[test]
    fn guard_marks_quiescent_on_drop() {
        let _t = ThreadRegistrationGuard::new().unwrap();
        let list = EpochList::new();
        {
            let _g = list.enter().unwrap();
        }
        let epoch = list.advance();
        // No outstanding guard: barrier must not block.
        list.retire_barrier(epoch);
    }
}
