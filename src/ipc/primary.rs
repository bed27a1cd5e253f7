// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Primary-side IPC control plane (§4.6), grounded in jbpf_io_ipc.c's
// `_jbpf_io_ipc_primary_thread` epoll loop and its address-negotiation
// state machine (`dipc_reg_status_t`, `MAX_NUM_JBPF_IPC_TRY_ATTEMPTS`).
//
// Each connecting secondary gets its own shared-memory arena, offered at
// whatever virtual address the primary's `mmap` happened to land on; if
// the secondary cannot map the same region at that exact address (it is
// already occupied in its own address space) the primary tries a fresh
// anonymous region and offers again, up to `wire::MAX_TRY_ATTEMPTS`
// rounds, exactly as the upstream negotiation loop does.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::arena::{Arena, HugepagePolicy};
use crate::channel::{ChannelRegistry, Direction};
use crate::config::IoConfig;
use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::ipc::addr::BootstrapAddr;
use crate::ipc::wire::{ChannelHandle, IpcMsg, RegStatus, CTL_BACKLOG, MAX_TRY_ATTEMPTS, WIRE_MSG_SIZE};
use crate::stream_id::StreamId;

fn read_msg(stream: &mut UnixStream) -> Result<IpcMsg> {
    let mut buf = [0u8; WIRE_MSG_SIZE];
    stream.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IoError::PeerLost
        } else {
            IoError::Io(e)
        }
    })?;
    IpcMsg::decode(&buf)
}

fn write_msg(stream: &mut UnixStream, msg: &IpcMsg) -> Result<()> {
    stream.write_all(&msg.encode()).map_err(IoError::Io)
}

/// One connected secondary: its negotiated shared arena, the `Heap`
/// carved from it, and this peer's own channel-handle table. Per
/// SPEC_FULL.md §9's decision, a `ChannelHandle` quoted back over the
/// wire is an index into *this* table, never a raw pointer — `ChDestroy`
/// and any future lookups validate the index against `handles` before
/// touching the shared registry, so a secondary can never reference (by
/// guessing an index) a channel that isn't its own.
struct PeerSession {
    stream: UnixStream,
    heap: Heap,
    _arena: Arena,
    handles: Vec<Option<(Direction, StreamId)>>,
}

impl PeerSession {
    fn alloc_handle(&mut self, direction: Direction, stream_id: StreamId) -> ChannelHandle {
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some((direction, stream_id));
                return ChannelHandle(i as u32);
            }
        }
        self.handles.push(Some((direction, stream_id)));
        ChannelHandle((self.handles.len() - 1) as u32)
    }

    /// Resolve a wire handle to the `(direction, stream_id)` it was
    /// issued for, clearing the slot. `None` for an out-of-range or
    /// already-cleared handle — the caller must treat that as a
    /// protocol error, not dereference anything.
    fn take_handle(&mut self, handle: ChannelHandle) -> Option<(Direction, StreamId)> {
        self.handles.get_mut(handle.0 as usize)?.take()
    }
}

/// Negotiate a shared arena with one freshly-accepted secondary,
/// retrying under a fresh address up to `MAX_TRY_ATTEMPTS` times.
fn negotiate_arena(stream: &mut UnixStream, namespace_dir: &std::path::Path, mem_size: usize, peer_tag: u64) -> Result<Arena> {
    let _req = read_msg(stream)?; // initial RegReq{status: Init, alloc_size}

    // Every tentative arena is kept alive (not just the most recent one)
    // until the negotiation terminates. Per §4.6 step 3, the primary must
    // never free a rejected mapping early: doing so would let the kernel
    // hand the freed address straight back to the next `Arena::create`,
    // re-offering the secondary the exact address it already rejected.
    // All but the winning (or, on exhaustion, none of the) attempts are
    // dropped only once the loop below returns.
    let mut attempts: Vec<Arena> = Vec::new();

    for attempt in 1..=MAX_TRY_ATTEMPTS {
        let mem_name = format!("peer_{peer_tag}_try{attempt}");
        let arena = Arena::create(namespace_dir, &mem_name, mem_size, true, HugepagePolicy::Prefer)?;
        write_msg(
            stream,
            &IpcMsg::RegResp {
                status: RegStatus::NegMmap,
                base_addr: arena.as_mut_ptr() as u64,
                adjusted_size: arena.len() as u64,
                mem_name: mem_name.clone(),
            },
        )?;
        attempts.push(arena);

        let reply = read_msg(stream)?;
        match reply {
            IpcMsg::RegReq { status: RegStatus::NegMmapSucc, .. } => {
                let arena = attempts.pop().expect("just pushed this attempt");
                write_msg(stream, &IpcMsg::RegResp { status: RegStatus::Succ, base_addr: arena.as_mut_ptr() as u64, adjusted_size: arena.len() as u64, mem_name })?;
                log::info!("ipc: peer {peer_tag} negotiated address match on attempt {attempt}");
                // `attempts` (the earlier, rejected tentative mappings)
                // is dropped here, unmapping each of them only now that
                // the winner is settled.
                return Ok(arena);
            }
            IpcMsg::RegReq { status: RegStatus::NegMmapFail, .. } => {
                log::warn!("ipc: peer {peer_tag} could not map attempt {attempt}'s address, retrying");
                continue;
            }
            _ => return Err(IoError::SerdeFailure("unexpected message during address negotiation")),
        }
    }

    write_msg(stream, &IpcMsg::RegResp { status: RegStatus::Fail, base_addr: 0, adjusted_size: 0, mem_name: String::new() })?;
    Err(IoError::HandshakeRetriesExceeded)
}

pub struct IpcPrimary {
    listener: UnixListener,
    epoll_fd: RawFd,
    namespace_dir: std::path::PathBuf,
    mem_size: usize,
    registry: Arc<Mutex<ChannelRegistry>>,
    peers: Mutex<HashMap<RawFd, PeerSession>>,
    running: Arc<AtomicBool>,
    next_peer_tag: std::sync::atomic::AtomicU64,
}

impl IpcPrimary {
    pub fn bind(config: &IoConfig, registry: Arc<Mutex<ChannelRegistry>>) -> Result<Self> {
        let crate::config::RoleConfig::Ipc(ipc_cfg) = &config.role else {
            return Err(IoError::InvalidAddress("ipc_primary requires an Ipc role".into()));
        };
        crate::config::ensure_namespace_dir(&config.namespace_dir())?;
        let addr = BootstrapAddr::parse(config, &ipc_cfg.bootstrap_addr)?;
        let BootstrapAddr::Unix { path } = addr else {
            return Err(IoError::InvalidAddress("vsock bootstrap sockets are not implemented".into()));
        };
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(IoError::Io)?;
        listener.set_nonblocking(true).map_err(IoError::Io)?;

        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: listener.as_raw_fd() as u64 };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, listener.as_raw_fd(), &mut ev) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err.into());
        }

        log::info!("ipc primary listening on {} (backlog {})", path.display(), CTL_BACKLOG);
        Ok(Self {
            listener,
            epoll_fd,
            namespace_dir: config.namespace_dir(),
            mem_size: ipc_cfg.mem_size,
            registry,
            peers: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
            next_peer_tag: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the control-plane loop on the calling thread until `shutdown`
    /// flips `running` to false. Intended to be wrapped in
    /// `std::thread::spawn` by the owning `io_ctx`.
    pub fn serve(self: &Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; crate::ipc::wire::MAX_NUM_IPC_PEERS + 1];
        while self.running.load(Ordering::Acquire) {
            let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, 1000) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("ipc primary: epoll_wait failed: {err}");
                break;
            }
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.listener.as_raw_fd() {
                    self.accept_all();
                } else {
                    self.service_peer(fd);
                }
            }
        }
        log::info!("ipc primary: control loop exiting");
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn accept_all(&self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let peer_tag = self.next_peer_tag.fetch_add(1, Ordering::Relaxed);
                    match negotiate_arena(&mut stream, &self.namespace_dir, self.mem_size, peer_tag) {
                        Ok(arena) => {
                            let heap = match unsafe { Heap::new(arena.as_mut_ptr(), arena.len()) } {
                                Ok(h) => h,
                                Err(e) => {
                                    log::error!("ipc primary: heap init failed for peer {peer_tag}: {e}");
                                    continue;
                                }
                            };
                            let raw_fd = stream.as_raw_fd();
                            if let Err(e) = stream.set_nonblocking(true) {
                                log::error!("ipc primary: set_nonblocking failed: {e}");
                                continue;
                            }
                            let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: raw_fd as u64 };
                            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, raw_fd, &mut ev) };
                            self.peers.lock().unwrap().insert(raw_fd, PeerSession { stream, heap, _arena: arena, handles: Vec::new() });
                            log::info!("ipc primary: peer {peer_tag} registered (fd {raw_fd})");
                        }
                        Err(e) => log::warn!("ipc primary: registration failed for peer {peer_tag}: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("ipc primary: accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn service_peer(&self, fd: RawFd) {
        let msg = {
            let mut peers = self.peers.lock().unwrap();
            let Some(session) = peers.get_mut(&fd) else { return };
            match read_msg(&mut session.stream) {
                Ok(m) => Some(m),
                Err(_) => None,
            }
        };
        let Some(msg) = msg else {
            self.drop_peer(fd);
            return;
        };
        let resp = self.dispatch(fd, msg);
        if let Some(resp) = resp {
            let mut peers = self.peers.lock().unwrap();
            if let Some(session) = peers.get_mut(&fd) {
                if write_msg(&mut session.stream, &resp).is_err() {
                    drop(peers);
                    self.drop_peer(fd);
                }
            }
        }
    }

    fn dispatch(&self, fd: RawFd, msg: IpcMsg) -> Option<IpcMsg> {
        match msg {
            IpcMsg::ChCreateReq { direction, priority, elem_size, num_elems, stream_id, .. } => {
                let mut peers = self.peers.lock().unwrap();
                let session = peers.get_mut(&fd)?;
                let mut registry = self.registry.lock().unwrap();
                match registry.create(&session.heap, direction, stream_id, priority, num_elems, elem_size as usize, None) {
                    Ok(_ch) => {
                        let handle = session.alloc_handle(direction, stream_id);
                        Some(IpcMsg::ChCreateResp { handle, ok: true })
                    }
                    Err(e) => {
                        log::warn!("ipc primary: channel create failed: {e}");
                        Some(IpcMsg::ChCreateResp { handle: ChannelHandle(0), ok: false })
                    }
                }
            }
            IpcMsg::ChDestroy { handle } => {
                let mut peers = self.peers.lock().unwrap();
                let Some(session) = peers.get_mut(&fd) else { return None };
                match session.take_handle(handle) {
                    Some((direction, stream_id)) => {
                        let mut registry = self.registry.lock().unwrap();
                        if let Err(e) = registry.destroy(direction, &stream_id) {
                            log::warn!("ipc primary: channel destroy failed: {e}");
                        }
                    }
                    None => log::warn!("ipc primary: peer on fd {fd} quoted an unknown/stale channel handle {}", handle.0),
                }
                None
            }
            IpcMsg::ChFindReq { stream_id, is_output } => {
                // Per §4.6: a find searches only the requesting peer's own
                // handle table, never the global registry, so a secondary
                // can never learn about another secondary's channels by
                // probing stream-ids it doesn't already hold a handle for.
                let direction = if is_output { Direction::Output } else { Direction::Input };
                let mut peers = self.peers.lock().unwrap();
                let session = peers.get_mut(&fd)?;
                let existing = session.handles.iter().enumerate().find_map(|(i, slot)| match slot {
                    Some((d, id)) if *d == direction && *id == stream_id => Some(ChannelHandle(i as u32)),
                    _ => None,
                });
                Some(IpcMsg::ChFindResp { handle: existing })
            }
            IpcMsg::DeregReq => {
                self.drop_peer(fd);
                Some(IpcMsg::DeregResp)
            }
            _ => None,
        }
    }

    fn drop_peer(&self, fd: RawFd) {
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        let session = self.peers.lock().unwrap().remove(&fd);
        if let Some(session) = session {
            let mut registry = self.registry.lock().unwrap();
            let mut torn_down = 0;
            for owned in session.handles.iter().flatten() {
                let _ = registry.destroy(owned.0, &owned.1);
                torn_down += 1;
            }
            log::info!("ipc primary: peer on fd {fd} disconnected, {torn_down} channel(s) torn down");
        }
    }
}

impl Drop for IpcPrimary {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

pub fn spawn(primary: Arc<IpcPrimary>) -> JoinHandle<()> {
    std::thread::spawn(move || primary.serve())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;

    fn unique_run_path() -> std::path::PathBuf {
        let pid = std::process::id();
        let tag = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::path::PathBuf::from(format!("/tmp/jbpf_ipc_primary_test_{pid}_{tag}"))
    }

    #[test]
    fn bind_creates_listening_socket_and_registers_with_epoll() {
        let run_path = unique_run_path();
        let config = IoConfig::ipc_primary("unix://ctl", 1 << 20).with_run_path(&run_path);
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));
        let primary = IpcPrimary::bind(&config, registry).unwrap();
        assert!(config.namespace_dir().join("ctl").exists());
        primary.shutdown();
        let _ = std::fs::remove_dir_all(&run_path);
    }
}
