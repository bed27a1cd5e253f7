// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// `io_ctx` (§2 "Control flow", §4.2): the top-level handle an embedder
// creates once at startup and holds for the lifetime of the process. It
// owns the arena, the thread-pinned heap used for any channel creation
// driven directly by the calling thread, the channel registry, and
// (for the two IPC roles) the control-plane session that negotiates
// shared memory with peers.
//
// The three `IoType`s share this one type rather than three separate
// ones because every embedder-facing operation (create a channel,
// reserve/submit, drain) is identical across roles once bootstrap has
// run; only *how* a channel's backing memory comes to be shared differs,
// and that's entirely encapsulated in `bootstrap`.

use std::sync::{Arc, Mutex};

use crate::arena::{Arena, HugepagePolicy};
use crate::channel::{Channel, ChannelRegistry, Direction};
use crate::config::{ensure_namespace_dir, IoConfig, IoType};
use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::ipc::{IpcPrimary, IpcSecondary};
use crate::stream_id::StreamId;
use crate::thread_reg::ThreadRegistrationGuard;

enum Role {
    LocalPrimary {
        _arena: Arena,
        heap: Heap,
    },
    IpcPrimary {
        _arena: Arena,
        heap: Heap,
        primary: Arc<IpcPrimary>,
        join: Option<std::thread::JoinHandle<()>>,
    },
    IpcSecondary {
        secondary: IpcSecondary,
    },
}

/// A bootstrapped I/O context. Not `Clone`; share it behind an `Arc` if
/// multiple threads need to create channels or drive control-plane
/// calls concurrently (the registry's own locking handles the rest).
pub struct IoCtx {
    config: IoConfig,
    registry: Arc<Mutex<ChannelRegistry>>,
    role: Role,
    _thread_guard: ThreadRegistrationGuard,
}

unsafe impl Send for IoCtx {}
unsafe impl Sync for IoCtx {}

impl IoCtx {
    /// Bootstrap per `config.io_type`:
    ///
    /// - `LocalPrimary`: allocate a private arena, carve a heap, done.
    /// - `IpcPrimary`: allocate a small private arena for channels the
    ///   primary process creates for itself, and start the control-plane
    ///   thread that negotiates a fresh shared arena per connecting
    ///   secondary (see `ipc::primary`).
    /// - `IpcSecondary`: connect to the primary; the negotiated shared
    ///   arena becomes this context's heap.
    pub fn bootstrap(config: IoConfig) -> Result<Self> {
        let thread_guard = ThreadRegistrationGuard::new().ok_or(IoError::CapacityExceeded)?;
        ensure_namespace_dir(&config.namespace_dir())?;
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));

        let role = match (&config.io_type, &config.role) {
            (IoType::LocalPrimary, crate::config::RoleConfig::Local(local)) => {
                let arena = Arena::create(&config.namespace_dir(), "local_primary", local.mem_size, false, HugepagePolicy::Prefer)?;
                let heap = unsafe { Heap::new(arena.as_mut_ptr(), arena.len())? };
                Role::LocalPrimary { _arena: arena, heap }
            }
            (IoType::IpcPrimary, crate::config::RoleConfig::Ipc(ipc_cfg)) => {
                let arena = Arena::create(&config.namespace_dir(), "primary_local", ipc_cfg.mem_size, false, HugepagePolicy::Prefer)?;
                let heap = unsafe { Heap::new(arena.as_mut_ptr(), arena.len())? };
                let primary = Arc::new(IpcPrimary::bind(&config, registry.clone())?);
                let join = crate::ipc::primary::spawn(primary.clone());
                Role::IpcPrimary { _arena: arena, heap, primary, join: Some(join) }
            }
            (IoType::IpcSecondary, crate::config::RoleConfig::Ipc(_)) => {
                let secondary = IpcSecondary::connect(&config)?;
                Role::IpcSecondary { secondary }
            }
            _ => return Err(IoError::InvalidAddress("io_type and role configuration disagree".into())),
        };

        log::info!("io_ctx: bootstrapped as {:?}", config.io_type);
        Ok(Self { config, registry, role, _thread_guard: thread_guard })
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    pub fn io_type(&self) -> IoType {
        self.config.io_type
    }

    /// The heap backing channels this context creates directly. For an
    /// IPC secondary this is the negotiated shared arena; for a primary
    /// (local or IPC) it is this process's own private heap.
    pub fn heap(&self) -> &Heap {
        match &self.role {
            Role::LocalPrimary { heap, .. } => heap,
            Role::IpcPrimary { heap, .. } => heap,
            Role::IpcSecondary { secondary } => secondary.heap(),
        }
    }

    pub fn registry(&self) -> &Arc<Mutex<ChannelRegistry>> {
        &self.registry
    }

    /// Create a channel directly against this context's own registry.
    /// On an IPC secondary this only registers a *local* view — the
    /// canonical registry lives with the primary, reached instead
    /// through `create_remote_channel`.
    pub fn create_channel(
        &self,
        direction: Direction,
        stream_id: StreamId,
        priority: u32,
        num_elems: u32,
        element_size: usize,
        serde_blob: Option<&[u8]>,
    ) -> Result<*mut Channel> {
        let mut registry = self.registry.lock().unwrap();
        registry.create(self.heap(), direction, stream_id, priority, num_elems, element_size, serde_blob)
    }

    /// Drive a secondary's channel create RPC against the primary.
    /// Only meaningful for `IoType::IpcSecondary`.
    pub fn create_remote_channel(&self, direction: Direction, stream_id: StreamId, priority: u32, num_elems: u32, element_size: u32) -> Result<crate::ipc::ChannelHandle> {
        match &self.role {
            Role::IpcSecondary { secondary } => secondary.create_channel(direction, priority, element_size, num_elems, stream_id),
            _ => Err(IoError::InvalidAddress("create_remote_channel requires an IpcSecondary context".into())),
        }
    }

    pub fn find_channel<R>(&self, direction: Direction, stream_id: &StreamId, f: impl FnOnce(&Channel) -> R) -> Option<R> {
        let registry = self.registry.lock().unwrap();
        registry.find(direction, stream_id, f)
    }

    /// `handle_out_bufs`: drain every output channel this context's
    /// registry owns. Meaningful for `LocalPrimary` and `IpcPrimary`;
    /// an `IpcSecondary` has no local registry entries to drain unless
    /// it has also created purely-local channels.
    pub fn drain_outputs(&self, cb: impl FnMut(&Channel, &StreamId, &[u8])) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.drain_outputs(cb)
    }

    pub fn send_msg(&self, stream_id: &StreamId, data: &[u8]) -> Result<()> {
        let registry = self.registry.lock().unwrap();
        registry.send_msg(stream_id, data)
    }

    /// Cleanly tear down the control-plane thread (IPC roles only). A
    /// no-op for `LocalPrimary`. Idempotent.
    pub fn shutdown(&self) {
        match &self.role {
            Role::LocalPrimary { .. } => {}
            Role::IpcPrimary { primary, .. } => primary.shutdown(),
            Role::IpcSecondary { secondary } => {
                if let Err(e) = secondary.deregister() {
                    log::warn!("io_ctx: deregister failed during shutdown: {e}");
                }
            }
        }
    }
}

impl Drop for IoCtx {
    fn drop(&mut self) {
        self.shutdown();
        if let Role::IpcPrimary { join, .. } = &mut self.role {
            if let Some(join) = join.take() {
                // The control thread observes `running` going false on its
                // own 1s epoll_wait timeout tick; join it so the listening
                // socket's file is gone before we return.
                let _ = join.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamId;

    fn unique_run_path(tag: &str) -> std::path::PathBuf {
        let pid = std::process::id();
        let ts = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::path::PathBuf::from(format!("/tmp/jbpf_ctx_test_{tag}_{pid}_{ts}"))
    }

    #[test]
    fn local_primary_bootstrap_creates_and_drains_a_channel() {
        let run_path = unique_run_path("local");
        let config = IoConfig::local_primary(1 << 20).with_run_path(&run_path);
        let ctx = IoCtx::bootstrap(config).unwrap();
        assert_eq!(ctx.io_type(), IoType::LocalPrimary);

        let id = StreamId::from_bytes([0x11; 16]);
        ctx.create_channel(Direction::Output, id, 0, 10, 8, None).unwrap();
        ctx.find_channel(Direction::Output, &id, |c| {
            c.enqueue(|buf| buf.fill(0x42)).unwrap();
        });
        let mut seen = 0;
        ctx.drain_outputs(|_c, _id, _payload| seen += 1);
        assert_eq!(seen, 1);

        let _ = std::fs::remove_dir_all(&run_path);
    }
}
