// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Secondary-side IPC control plane (§4.6), grounded in jbpf_io_ipc.c's
// `_jbpf_io_ipc_connect_to_primary` and its `mmap(..., MAP_FIXED, ...)`
// retry loop (the secondary half of the same negotiation `primary.rs`
// drives).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use crate::arena::Arena;
use crate::channel::Direction;
use crate::config::IoConfig;
use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::ipc::addr::BootstrapAddr;
use crate::ipc::wire::{ChannelHandle, IpcMsg, RegStatus, MAX_TRY_ATTEMPTS, WIRE_MSG_SIZE};
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

/// Attempt to mmap the primary's offered region at the exact address it
/// proposed. A `MAP_FIXED` collision surfaces as `Arena::attach`
/// returning an error; that is a normal, expected outcome of the
/// negotiation and is reported back to the primary rather than
/// propagated as a hard failure.
fn negotiate_arena(stream: &mut UnixStream, namespace_dir: &std::path::Path, mem_size: u64) -> Result<Arena> {
    write_msg(stream, &IpcMsg::RegReq { status: RegStatus::Init, alloc_size: mem_size })?;

    for attempt in 1..=MAX_TRY_ATTEMPTS {
        let offer = read_msg(stream)?;
        let (status, base_addr, adjusted_size, mem_name) = match offer {
            IpcMsg::RegResp { status: RegStatus::NegMmap, base_addr, adjusted_size, mem_name } => (RegStatus::NegMmap, base_addr, adjusted_size, mem_name),
            IpcMsg::RegResp { status: RegStatus::Fail, .. } => return Err(IoError::HandshakeRetriesExceeded),
            _ => return Err(IoError::SerdeFailure("unexpected message during address negotiation")),
        };
        let _ = status;

        match Arena::attach(namespace_dir, &mem_name, adjusted_size as usize, Some(base_addr as *mut u8)) {
            Ok(arena) => {
                write_msg(stream, &IpcMsg::RegReq { status: RegStatus::NegMmapSucc, alloc_size: mem_size })?;
                let ack = read_msg(stream)?;
                match ack {
                    IpcMsg::RegResp { status: RegStatus::Succ, .. } => {
                        log::info!("ipc secondary: negotiated shared arena on attempt {attempt}");
                        return Ok(arena);
                    }
                    _ => return Err(IoError::SerdeFailure("primary did not confirm address match")),
                }
            }
            Err(e) => {
                log::warn!("ipc secondary: could not map offered address on attempt {attempt}: {e}");
                write_msg(stream, &IpcMsg::RegReq { status: RegStatus::NegMmapFail, alloc_size: mem_size })?;
                continue;
            }
        }
    }
    // The primary sends one final `Fail` confirmation once its own
    // retry budget is exhausted too; consume it so the stream is left
    // at a clean message boundary for whatever the caller does next
    // (typically closing the connection).
    let _ = read_msg(stream);
    Err(IoError::HandshakeRetriesExceeded)
}

/// A connected secondary peer: the negotiated shared arena plus the
/// `Heap` it backs, and the single control stream used for subsequent
/// channel create/destroy/find RPCs.
pub struct IpcSecondary {
    stream: Mutex<UnixStream>,
    heap: Heap,
    _arena: Arena,
}

impl IpcSecondary {
    pub fn connect(config: &IoConfig) -> Result<Self> {
        let crate::config::RoleConfig::Ipc(ipc_cfg) = &config.role else {
            return Err(IoError::InvalidAddress("ipc_secondary requires an Ipc role".into()));
        };
        let addr = BootstrapAddr::parse(config, &ipc_cfg.bootstrap_addr)?;
        let BootstrapAddr::Unix { path } = addr else {
            return Err(IoError::InvalidAddress("vsock bootstrap sockets are not implemented".into()));
        };
        let mut stream = UnixStream::connect(&path).map_err(IoError::Io)?;
        let arena = negotiate_arena(&mut stream, &config.namespace_dir(), ipc_cfg.mem_size as u64)?;
        let heap = unsafe { Heap::new(arena.as_mut_ptr(), arena.len())? };
        log::info!("ipc secondary: connected to {}", path.display());
        Ok(Self { stream: Mutex::new(stream), heap, _arena: arena })
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Ask the primary to create a channel in its registry, backed by
    /// this session's negotiated arena (so both sides address the same
    /// bytes). Returns the primary's opaque handle for the new channel.
    pub fn create_channel(&self, direction: Direction, priority: u32, elem_size: u32, num_elems: u32, stream_id: StreamId) -> Result<ChannelHandle> {
        let mut stream = self.stream.lock().unwrap();
        write_msg(&mut stream, &IpcMsg::ChCreateReq { direction, priority, elem_size, num_elems, stream_id, descriptor_len: 0 })?;
        match read_msg(&mut stream)? {
            IpcMsg::ChCreateResp { handle, ok: true } => Ok(handle),
            IpcMsg::ChCreateResp { ok: false, .. } => Err(IoError::CapacityExceeded),
            _ => Err(IoError::SerdeFailure("unexpected response to channel create")),
        }
    }

    pub fn find_channel(&self, stream_id: StreamId, is_output: bool) -> Result<Option<ChannelHandle>> {
        let mut stream = self.stream.lock().unwrap();
        write_msg(&mut stream, &IpcMsg::ChFindReq { stream_id, is_output })?;
        match read_msg(&mut stream)? {
            IpcMsg::ChFindResp { handle } => Ok(handle),
            _ => Err(IoError::SerdeFailure("unexpected response to channel find")),
        }
    }

    pub fn destroy_channel(&self, handle: ChannelHandle) -> Result<()> {
        let mut stream = self.stream.lock().unwrap();
        write_msg(&mut stream, &IpcMsg::ChDestroy { handle })
    }

    pub fn deregister(&self) -> Result<()> {
        let mut stream = self.stream.lock().unwrap();
        write_msg(&mut stream, &IpcMsg::DeregReq)?;
        match read_msg(&mut stream)? {
            IpcMsg::DeregResp => Ok(()),
            _ => Err(IoError::SerdeFailure("unexpected response to deregister")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn negotiate_arena_exhausts_retry_budget_and_reports_handshake_failure() {
        let pid = std::process::id();
        let tag = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let run_path = std::path::PathBuf::from(format!("/tmp/jbpf_ipc_secondary_test_{pid}_{tag}"));
        std::fs::create_dir_all(&run_path).unwrap();
        let sock_path = run_path.join("ctl.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut srv, _) = listener.accept().unwrap();
            let _init = read_msg(&mut srv).unwrap();

            // Every offer targets an address below the kernel's
            // unprivileged mmap_min_addr floor, so MAP_FIXED_NOREPLACE
            // there is guaranteed to fail regardless of what else is
            // mapped in the test process — deterministically exercising
            // the full retry budget without ever needing a real mmap to
            // succeed in-process.
            for _ in 0..MAX_TRY_ATTEMPTS {
                write_msg(&mut srv, &IpcMsg::RegResp { status: RegStatus::NegMmap, base_addr: 0x1000, adjusted_size: 1 << 20, mem_name: "bogus_hold".to_string() }).unwrap();
                assert!(matches!(read_msg(&mut srv).unwrap(), IpcMsg::RegReq { status: RegStatus::NegMmapFail, .. }));
            }
            write_msg(&mut srv, &IpcMsg::RegResp { status: RegStatus::Fail, base_addr: 0, adjusted_size: 0, mem_name: String::new() }).unwrap();
        });

        let mut client = UnixStream::connect(&sock_path).unwrap();
        let err = negotiate_arena(&mut client, &run_path, 1 << 20).unwrap_err();
        assert!(matches!(err, IoError::HandshakeRetriesExceeded));
        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&run_path);
    }
}
