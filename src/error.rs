// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by every subsystem in this crate.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IoError>;

/// Failure modes surfaced at the public API boundary.
///
/// Steady-state "try again" outcomes (pool empty, ring full, nothing to
/// dequeue) are `Option::None`, not an `IoError` variant — they are not
/// errors, they are normal backpressure.
#[derive(Debug, Error)]
pub enum IoError {
    /// A mempool alloc or queue reserve failed because the pool has no
    /// free elements left and is not merely momentarily contended.
    #[error("mempool exhausted")]
    PoolExhausted,

    /// The calling thread never called `register_thread` (or auto-registration
    /// is disabled) and attempted an operation that requires a thread id.
    #[error("calling thread is not registered")]
    ThreadNotRegistered,

    /// A channel create was attempted with a stream-id already present in
    /// that direction's registry.
    #[error("stream-id already registered in this direction")]
    DuplicateStreamId,

    /// `MAX_CHANNELS`, `MAX_THREADS` or `MAX_NUM_IPC_PEERS` would be exceeded.
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// The IPC registration handshake exhausted `MAX_TRY_ATTEMPTS` address
    /// negotiation rounds without success.
    #[error("IPC handshake exceeded retry budget")]
    HandshakeRetriesExceeded,

    /// A short read (or EOF) was observed on a control-plane or LCM socket
    /// mid-operation; the owning peer/connection has been torn down.
    #[error("peer connection lost")]
    PeerLost,

    /// A channel's serde plug-in is missing the requested direction, or
    /// the call into it failed / produced a truncated result.
    #[error("serde failure: {0}")]
    SerdeFailure(&'static str),

    /// Arena/heap reservation failed; the owning `io_ctx` never starts.
    #[error("arena allocation failed")]
    ArenaAllocFailed,

    /// A bootstrap address string did not parse as `unix://`, `vsock://`
    /// or a bare relative path.
    #[error("invalid bootstrap address: {0}")]
    InvalidAddress(String),

    /// Underlying OS call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
