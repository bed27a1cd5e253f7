// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// IPC control-plane wire messages (§6 "Wire format — IPC control
// messages"), grounded in jbpf_io_ipc_msg.h's `jbpf_io_ipc_msg` tagged
// union. The original transmits a raw `memcpy`-shaped struct over
// `MSG_WAITALL`; this translation keeps the same fixed-size,
// tag-prefixed framing but encodes/decodes explicitly with
// `to_le_bytes`/`from_le_bytes` instead of reinterpreting raw struct
// bytes, so there is no reliance on two processes' compilers agreeing
// on padding.
//
// A channel pointer on the wire becomes a `ChannelHandle(u32)`: an
// index into the peer's own per-direction table, never a raw address
// (see SPEC_FULL.md §9's decision on this point).

use crate::channel::Direction;
use crate::error::{IoError, Result};
use crate::stream_id::StreamId;

pub const MAX_MEM_NAMELEN: usize = 128;
/// Matches `MAX_NUM_JBPF_IPC_TRY_ATTEMPTS`.
pub const MAX_TRY_ATTEMPTS: u32 = 10;
/// Matches `JBPF_IO_IPC_CTL_BACKLOG`.
pub const CTL_BACKLOG: i32 = 32;
/// Matches `MAX_NUM_JBPF_IO_IPC_PEERS`.
pub const MAX_NUM_IPC_PEERS: usize = 64;

/// Fixed-size encoded form of every wire message: a `u32` tag followed
/// by the largest payload's worth of bytes, zero-padded.
pub const WIRE_MSG_SIZE: usize = 4 + 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegStatus {
    Init = 0,
    AllocFail = 1,
    NegMmap = 2,
    NegMmapSucc = 3,
    NegMmapFail = 4,
    Succ = 5,
    Fail = 6,
}

impl RegStatus {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Self::Init,
            1 => Self::AllocFail,
            2 => Self::NegMmap,
            3 => Self::NegMmapSucc,
            4 => Self::NegMmapFail,
            5 => Self::Succ,
            6 => Self::Fail,
            _ => return Err(IoError::SerdeFailure("unrecognized reg status on wire")),
        })
    }
}

/// Peer-scoped channel reference quoted back over the control socket,
/// never a raw pointer. Validated as a live index before dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum IpcMsg {
    RegReq { status: RegStatus, alloc_size: u64 },
    RegResp { status: RegStatus, base_addr: u64, adjusted_size: u64, mem_name: String },
    DeregReq,
    DeregResp,
    ChCreateReq { direction: Direction, priority: u32, elem_size: u32, num_elems: u32, stream_id: StreamId, descriptor_len: u32 },
    ChCreateResp { handle: ChannelHandle, ok: bool },
    ChDestroy { handle: ChannelHandle },
    ChFindReq { stream_id: StreamId, is_output: bool },
    ChFindResp { handle: Option<ChannelHandle> },
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

const TAG_REG_REQ: u32 = 0;
const TAG_REG_RESP: u32 = 1;
const TAG_DEREG_REQ: u32 = 2;
const TAG_DEREG_RESP: u32 = 3;
const TAG_CH_CREATE_REQ: u32 = 4;
const TAG_CH_CREATE_RESP: u32 = 5;
const TAG_CH_DESTROY: u32 = 6;
const TAG_CH_FIND_REQ: u32 = 7;
const TAG_CH_FIND_RESP: u32 = 8;

impl IpcMsg {
    /// Encode into a fixed `WIRE_MSG_SIZE`-byte frame.
    pub fn encode(&self) -> [u8; WIRE_MSG_SIZE] {
        let mut buf = [0u8; WIRE_MSG_SIZE];
        match self {
            IpcMsg::RegReq { status, alloc_size } => {
                put_u32(&mut buf, 0, TAG_REG_REQ);
                put_u32(&mut buf, 4, *status as u32);
                put_u64(&mut buf, 8, *alloc_size);
            }
            IpcMsg::RegResp { status, base_addr, adjusted_size, mem_name } => {
                put_u32(&mut buf, 0, TAG_REG_RESP);
                put_u32(&mut buf, 4, *status as u32);
                put_u64(&mut buf, 8, *base_addr);
                put_u64(&mut buf, 16, *adjusted_size);
                let name_bytes = mem_name.as_bytes();
                let n = name_bytes.len().min(MAX_MEM_NAMELEN - 1);
                buf[24..24 + n].copy_from_slice(&name_bytes[..n]);
            }
            IpcMsg::DeregReq => {
                put_u32(&mut buf, 0, TAG_DEREG_REQ);
            }
            IpcMsg::DeregResp => {
                put_u32(&mut buf, 0, TAG_DEREG_RESP);
            }
            IpcMsg::ChCreateReq { direction, priority, elem_size, num_elems, stream_id, descriptor_len } => {
                put_u32(&mut buf, 0, TAG_CH_CREATE_REQ);
                put_u32(&mut buf, 4, if *direction == Direction::Output { 0 } else { 1 });
                put_u32(&mut buf, 8, *priority);
                put_u32(&mut buf, 12, *elem_size);
                put_u32(&mut buf, 16, *num_elems);
                buf[20..36].copy_from_slice(stream_id.as_bytes());
                put_u32(&mut buf, 36, *descriptor_len);
            }
            IpcMsg::ChCreateResp { handle, ok } => {
                put_u32(&mut buf, 0, TAG_CH_CREATE_RESP);
                put_u32(&mut buf, 4, handle.0);
                put_u32(&mut buf, 8, *ok as u32);
            }
            IpcMsg::ChDestroy { handle } => {
                put_u32(&mut buf, 0, TAG_CH_DESTROY);
                put_u32(&mut buf, 4, handle.0);
            }
            IpcMsg::ChFindReq { stream_id, is_output } => {
                put_u32(&mut buf, 0, TAG_CH_FIND_REQ);
                buf[4..20].copy_from_slice(stream_id.as_bytes());
                put_u32(&mut buf, 20, *is_output as u32);
            }
            IpcMsg::ChFindResp { handle } => {
                put_u32(&mut buf, 0, TAG_CH_FIND_RESP);
                put_u32(&mut buf, 4, handle.is_some() as u32);
                put_u32(&mut buf, 8, handle.map(|h| h.0).unwrap_or(0));
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WIRE_MSG_SIZE {
            return Err(IoError::SerdeFailure("short ipc_msg frame"));
        }
        Ok(match get_u32(buf, 0) {
            TAG_REG_REQ => IpcMsg::RegReq { status: RegStatus::from_u32(get_u32(buf, 4))?, alloc_size: get_u64(buf, 8) },
            TAG_REG_RESP => {
                let raw = &buf[24..24 + MAX_MEM_NAMELEN.min(buf.len() - 24)];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let mem_name = String::from_utf8_lossy(&raw[..end]).into_owned();
                IpcMsg::RegResp {
                    status: RegStatus::from_u32(get_u32(buf, 4))?,
                    base_addr: get_u64(buf, 8),
                    adjusted_size: get_u64(buf, 16),
                    mem_name,
                }
            }
            TAG_DEREG_REQ => IpcMsg::DeregReq,
            TAG_DEREG_RESP => IpcMsg::DeregResp,
            TAG_CH_CREATE_REQ => IpcMsg::ChCreateReq {
                direction: if get_u32(buf, 4) == 0 { Direction::Output } else { Direction::Input },
                priority: get_u32(buf, 8),
                elem_size: get_u32(buf, 12),
                num_elems: get_u32(buf, 16),
                stream_id: StreamId::from_slice(&buf[20..36]).ok_or(IoError::SerdeFailure("truncated stream_id"))?,
                descriptor_len: get_u32(buf, 36),
            },
            TAG_CH_CREATE_RESP => IpcMsg::ChCreateResp { handle: ChannelHandle(get_u32(buf, 4)), ok: get_u32(buf, 8) != 0 },
            TAG_CH_DESTROY => IpcMsg::ChDestroy { handle: ChannelHandle(get_u32(buf, 4)) },
            TAG_CH_FIND_REQ => IpcMsg::ChFindReq {
                stream_id: StreamId::from_slice(&buf[4..20]).ok_or(IoError::SerdeFailure("truncated stream_id"))?,
                is_output: get_u32(buf, 20) != 0,
            },
            TAG_CH_FIND_RESP => {
                let present = get_u32(buf, 4) != 0;
                IpcMsg::ChFindResp { handle: present.then(|| ChannelHandle(get_u32(buf, 8))) }
            }
            _ => return Err(IoError::SerdeFailure("unrecognized ipc_msg tag")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_req_round_trips() {
        let msg = IpcMsg::RegReq { status: RegStatus::Init, alloc_size: 1 << 30 };
        let encoded = msg.encode();
        assert_eq!(IpcMsg::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn reg_resp_round_trips_mem_name() {
        let msg = IpcMsg::RegResp { status: RegStatus::NegMmap, base_addr: 0x7f0000000000, adjusted_size: 1 << 30, mem_name: "jbpf_shm_7".to_string() };
        let encoded = msg.encode();
        assert_eq!(IpcMsg::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn ch_create_req_round_trips() {
        let msg = IpcMsg::ChCreateReq {
            direction: Direction::Output,
            priority: 0,
            elem_size: 8,
            num_elems: 100,
            stream_id: StreamId::from_bytes([0xAB; 16]),
            descriptor_len: 0,
        };
        let encoded = msg.encode();
        assert_eq!(IpcMsg::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn ch_find_resp_round_trips_absent_handle() {
        let msg = IpcMsg::ChFindResp { handle: None };
        let encoded = msg.encode();
        assert_eq!(IpcMsg::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(IpcMsg::decode(&[0u8; 4]).is_err());
    }
}
