// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The I/O substrate of a sandboxed in-process extension framework:
// named typed channels over lock-free queues, arena/heap memory
// management with a hugepage-preferring allocation cascade, and an IPC
// control plane that negotiates shared memory between a primary
// process and its secondaries.

pub mod error;
pub use error::{IoError, Result};

pub mod config;
pub use config::{IoConfig, IoType};

pub mod shm_name;
pub mod stream_id;
pub use stream_id::StreamId;

pub mod thread_reg;
pub mod epoch;
mod spin_lock;

pub mod arena;
pub use arena::{Arena, HugepagePolicy};

pub mod heap;
pub use heap::Heap;

pub mod ring;

pub mod mempool;
pub use mempool::{Mempool, MempoolKind};

pub mod ioqueue;
pub use ioqueue::Queue;

pub mod serde_plugin;
pub use serde_plugin::SerdePlugin;

pub mod channel;
pub use channel::{Channel, ChannelRegistry, Direction};

pub mod ipc;

pub mod lcm;

pub mod ctx;
pub use ctx::IoCtx;
