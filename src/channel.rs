// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named typed channel (§4.4) tying a queue to a direction, priority,
// element size and optional serde plug-in, plus the per-primary channel
// registry: two direction-keyed tables (dense array + open-addressed
// hash table) with epoch-based reclamation so lookups never block on
// create/destroy.
//
// The registry's mutating entry points (`create`, `destroy`) take
// `&mut self`: the only holder of `&mut ChannelRegistry` is the IPC
// control thread or, for a local primary, whichever thread is driving
// the create/destroy call directly (see SPEC_FULL.md §9's decision on
// enforcing single-writer discipline at the type level).
//
// Unlike the mempool and queue, a `Channel`'s own bookkeeping struct is
// not placed inside the shared arena: only the data-plane bytes (the
// mempool and ring backing its queue) need to be the same memory in
// both processes of an IPC session. The channel metadata — including a
// loaded serde plug-in's process-local `dlopen` handle — is looked up
// by stream-id through the control-plane RPCs (`ChannelHandle`, see
// `ipc::wire`) rather than shared as raw struct bytes across the
// boundary, so each process keeps its own `Channel` allocation.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::{IoError, Result};
use crate::heap::Heap;
use crate::ioqueue::Queue;
use crate::mempool::MempoolKind;
use crate::serde_plugin::SerdePlugin;
use crate::stream_id::StreamId;

/// Matches `JBPF_IO_MAX_NUM_CHANNELS` in the upstream header.
pub const MAX_CHANNELS: usize = 512;
/// Open-addressing table at least 2x oversized relative to `MAX_CHANNELS`
/// to keep probe sequences short even when nearly full.
const HT_CAPACITY: usize = 1024;
/// Matches `JBPF_IO_BUFS_BATCH_SIZE`.
pub const BATCH_SIZE: usize = 10;

fn tombstone() -> *mut Channel {
    std::ptr::NonNull::<Channel>::dangling().as_ptr()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

pub struct Channel {
    stream_id: StreamId,
    direction: Direction,
    priority: u32,
    element_size: usize,
    queue: *mut Queue,
    primary_serde: Option<SerdePlugin>,
    secondary_serde: Option<SerdePlugin>,
}

unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    fn queue(&self) -> &Queue {
        unsafe { &*self.queue }
    }

    pub fn reserve(&self) -> Result<*mut u8> {
        self.queue().reserve()
    }

    pub fn submit(&self) -> Result<()> {
        self.queue().submit()
    }

    pub fn enqueue(&self, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        self.queue().enqueue(fill)
    }

    pub fn dequeue(&self) -> Option<*mut u8> {
        self.queue().dequeue()
    }

    pub fn finish(&self, data_ptr: *mut u8) {
        self.queue().finish(data_ptr)
    }

    /// Batch-receive up to `BATCH_SIZE` elements, invoking `f` with each
    /// payload slice before returning its mbuf to the pool.
    pub fn drain_batch(&self, mut f: impl FnMut(&[u8])) -> usize {
        let mut n = 0;
        while n < BATCH_SIZE {
            let Some(ptr) = self.dequeue() else { break };
            let slice = unsafe { slice::from_raw_parts(ptr, self.element_size) };
            f(slice);
            self.finish(ptr);
            n += 1;
        }
        n
    }

    /// Attach this process's own loaded serde plug-in. `is_primary_side`
    /// selects which of the two independent slots — the primary's or
    /// the secondary's — this process populates; each side only ever
    /// reads back its own slot.
    pub fn attach_serde(&mut self, blob: &[u8], is_primary_side: bool) -> Result<()> {
        let name_hint = format!("{:?}", self.stream_id);
        let plugin = SerdePlugin::load(&name_hint, blob)?;
        if is_primary_side {
            self.primary_serde = Some(plugin);
        } else {
            self.secondary_serde = Some(plugin);
        }
        Ok(())
    }

    fn serde(&self) -> Option<&SerdePlugin> {
        self.primary_serde.as_ref().or(self.secondary_serde.as_ref())
    }

    /// Write the 16-byte stream-id prefix followed by the serialized
    /// form of the `element_size` bytes at `data_ptr` into `buf`,
    /// returning the total number of bytes written.
    ///
    /// # Safety
    /// `data_ptr` must point to `element_size` readable bytes (normally
    /// a data pointer obtained from this channel's own queue).
    pub unsafe fn pack(&self, data_ptr: *mut u8, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 16 {
            return Err(IoError::CapacityExceeded);
        }
        let serde = self.serde().ok_or(IoError::SerdeFailure("channel has no serializer"))?;
        buf[..16].copy_from_slice(self.stream_id.as_bytes());
        let input = slice::from_raw_parts_mut(data_ptr, self.element_size);
        let n = serde.serialize(input, &mut buf[16..])?;
        Ok(16 + n)
    }

    /// Reserve a buffer on this channel's queue and deserialize
    /// `payload` into it, releasing the reservation on decode failure.
    pub fn unpack_into(&self, payload: &mut [u8]) -> Result<*mut u8> {
        let serde = self.serde().ok_or(IoError::SerdeFailure("channel has no deserializer"))?;
        let buf = self.reserve()?;
        let out = unsafe { slice::from_raw_parts_mut(buf, self.element_size) };
        if let Err(e) = serde.deserialize(payload, out) {
            let _ = self.queue().release();
            return Err(e);
        }
        Ok(buf)
    }
}

/// Free a channel's queue and the channel struct itself. Called only
/// once a registry's epoch-retire barrier has confirmed no reader can
/// still be holding a reference obtained before removal.
unsafe fn destroy_channel(ch: *mut Channel) {
    let channel = &*ch;
    channel.queue().destroy();
    log::info!("channel: destroyed stream_id={:?} direction={:?}", channel.stream_id, channel.direction);
    drop(Box::from_raw(ch));
}

struct DirectionTable {
    dense: Vec<AtomicPtr<Channel>>,
    buckets: Vec<AtomicPtr<Channel>>,
    count: AtomicUsize,
    epochs: crate::epoch::EpochList,
}

impl DirectionTable {
    fn new() -> Self {
        Self {
            dense: (0..MAX_CHANNELS).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            buckets: (0..HT_CAPACITY).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            count: AtomicUsize::new(0),
            epochs: crate::epoch::EpochList::new(),
        }
    }

    fn bucket_start(&self, id: &StreamId) -> usize {
        (id.bucket_hash() as usize) & (HT_CAPACITY - 1)
    }

    fn contains(&self, id: &StreamId) -> bool {
        let mut idx = self.bucket_start(id);
        for _ in 0..HT_CAPACITY {
            let cur = self.buckets[idx].load(Ordering::Acquire);
            if cur.is_null() {
                return false;
            }
            if cur != tombstone() && unsafe { (*cur).stream_id } == *id {
                return true;
            }
            idx = (idx + 1) & (HT_CAPACITY - 1);
        }
        false
    }

    fn is_full(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= MAX_CHANNELS
    }

    fn insert(&mut self, ch: *mut Channel) -> Result<()> {
        let id = unsafe { (*ch).stream_id };
        let mut idx = self.bucket_start(&id);
        let mut inserted_bucket = false;
        for _ in 0..HT_CAPACITY {
            let cur = self.buckets[idx].load(Ordering::Acquire);
            if cur.is_null() || cur == tombstone() {
                self.buckets[idx].store(ch, Ordering::Release);
                inserted_bucket = true;
                break;
            }
            idx = (idx + 1) & (HT_CAPACITY - 1);
        }
        if !inserted_bucket {
            return Err(IoError::CapacityExceeded);
        }
        for slot in self.dense.iter() {
            if slot.compare_exchange(ptr::null_mut(), ch, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                self.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        // Dense array full: undo the hash-table insert before reporting.
        self.buckets[idx].store(tombstone(), Ordering::Release);
        Err(IoError::CapacityExceeded)
    }

    fn remove(&mut self, id: &StreamId) -> Option<*mut Channel> {
        let mut idx = self.bucket_start(id);
        let mut found = ptr::null_mut();
        for _ in 0..HT_CAPACITY {
            let cur = self.buckets[idx].load(Ordering::Acquire);
            if cur.is_null() {
                return None;
            }
            if cur != tombstone() && unsafe { (*cur).stream_id } == *id {
                found = cur;
                self.buckets[idx].store(tombstone(), Ordering::Release);
                break;
            }
            idx = (idx + 1) & (HT_CAPACITY - 1);
        }
        if found.is_null() {
            return None;
        }
        for slot in self.dense.iter() {
            if slot.compare_exchange(found, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Some(found);
            }
        }
        Some(found)
    }

    fn with_channel<R>(&self, id: &StreamId, f: impl FnOnce(&Channel) -> R) -> Option<R> {
        let _guard = self.epochs.enter()?;
        let mut idx = self.bucket_start(id);
        for _ in 0..HT_CAPACITY {
            let cur = self.buckets[idx].load(Ordering::Acquire);
            if cur.is_null() {
                return None;
            }
            if cur != tombstone() && unsafe { (*cur).stream_id } == *id {
                return Some(f(unsafe { &*cur }));
            }
            idx = (idx + 1) & (HT_CAPACITY - 1);
        }
        None
    }

    /// Iterate non-null dense-array slots under one epoch section, for
    /// the drain path (`handle_out_bufs`). The callback sees a `&Channel`
    /// valid only for the duration of this call.
    fn for_each(&self, mut f: impl FnMut(&Channel)) {
        let Some(_guard) = self.epochs.enter() else { return };
        for slot in self.dense.iter() {
            let cur = slot.load(Ordering::Acquire);
            if !cur.is_null() {
                f(unsafe { &*cur });
            }
        }
    }
}

pub struct ChannelRegistry {
    input: DirectionTable,
    output: DirectionTable,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { input: DirectionTable::new(), output: DirectionTable::new() }
    }

    fn table(&self, direction: Direction) -> &DirectionTable {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut DirectionTable {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    /// Create a channel carrying `num_elems` elements of `element_size`
    /// bytes, backed by a queue carved out of `heap`. Rejects a
    /// duplicate stream-id within `direction` before checking capacity,
    /// matching the upstream ordering (both are enforced under the
    /// single `&mut self` borrow, so no race between the two checks is
    /// possible here).
    pub fn create(
        &mut self,
        heap: &Heap,
        direction: Direction,
        stream_id: StreamId,
        priority: u32,
        num_elems: u32,
        element_size: usize,
        serde_blob: Option<&[u8]>,
    ) -> Result<*mut Channel> {
        let table = self.table_mut(direction);
        if table.contains(&stream_id) {
            log::warn!("channel: duplicate stream_id={stream_id:?} create attempt (direction={direction:?})");
            return Err(IoError::DuplicateStreamId);
        }
        if table.is_full() {
            return Err(IoError::CapacityExceeded);
        }
        let kind = match direction {
            Direction::Output => MempoolKind::Sp,
            Direction::Input => MempoolKind::Mp,
        };
        let queue = Queue::create(heap, kind, num_elems, element_size)?;
        let primary_serde = match serde_blob {
            Some(blob) => Some(SerdePlugin::load(&format!("{stream_id:?}"), blob)?),
            None => None,
        };
        let ch = Box::into_raw(Box::new(Channel {
            stream_id,
            direction,
            priority,
            element_size,
            queue,
            primary_serde,
            secondary_serde: None,
        }));
        if let Err(e) = table.insert(ch) {
            unsafe { drop(Box::from_raw(ch)) };
            return Err(e);
        }
        log::info!("channel: created stream_id={stream_id:?} direction={direction:?} elems={num_elems} elem_size={element_size}");
        Ok(ch)
    }

    /// Remove `stream_id` from `direction`'s tables, then block until
    /// every active reader has quiesced before freeing it. A no-op
    /// (`Ok(())`) if no such channel exists — destroy is idempotent.
    pub fn destroy(&mut self, direction: Direction, stream_id: &StreamId) -> Result<()> {
        let table = self.table_mut(direction);
        let Some(ch) = table.remove(stream_id) else {
            return Ok(());
        };
        let retired_at = table.epochs.advance();
        table.epochs.retire_barrier(retired_at);
        unsafe { destroy_channel(ch) };
        Ok(())
    }

    /// Look up `stream_id` within `direction` under one epoch section,
    /// invoking `f` with the channel. Returns `None` if not found.
    pub fn find<R>(&self, direction: Direction, stream_id: &StreamId, f: impl FnOnce(&Channel) -> R) -> Option<R> {
        self.table(direction).with_channel(stream_id, f)
    }

    /// `handle_out_bufs`: batch-receive from every output channel,
    /// invoking `cb` with the channel, its stream-id, and each payload.
    /// Callable only on a primary `io_ctx` per §4.4.
    pub fn drain_outputs(&self, mut cb: impl FnMut(&Channel, &StreamId, &[u8])) -> usize {
        let mut total = 0;
        self.output.for_each(|channel| {
            let stream_id = channel.stream_id();
            total += channel.drain_batch(|payload| cb(channel, &stream_id, payload));
        });
        total
    }

    /// `send_msg`: find the named input channel, reserve a buffer,
    /// copy up to `data.len()` bytes (rejecting an oversized payload),
    /// and submit.
    pub fn send_msg(&self, stream_id: &StreamId, data: &[u8]) -> Result<()> {
        self.find(Direction::Input, stream_id, |channel| {
            if data.len() > channel.element_size() {
                return Err(IoError::CapacityExceeded);
            }
            let buf = channel.reserve()?;
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len()) };
            channel.submit()
        })
        .ok_or(IoError::SerdeFailure("no such input channel"))?
    }

    /// `pack_msg`: serialize through the named output channel's serde.
    ///
    /// # Safety
    /// `data_ptr` must point to `element_size` readable bytes for the
    /// resolved channel.
    pub unsafe fn pack_msg(&self, stream_id: &StreamId, data_ptr: *mut u8, buf: &mut [u8]) -> Result<usize> {
        self.find(Direction::Output, stream_id, |channel| channel.pack(data_ptr, buf))
            .ok_or(IoError::SerdeFailure("no such output channel"))?
    }

    /// `unpack_msg`: peel the 16-byte stream-id prefix, find the
    /// matching channel in either direction (output first, then
    /// input), and deserialize the remainder into a freshly reserved
    /// buffer.
    pub fn unpack_msg(&self, bytes: &[u8]) -> Result<(StreamId, *mut u8)> {
        let stream_id = StreamId::from_slice(bytes).ok_or(IoError::SerdeFailure("message shorter than stream-id prefix"))?;
        let payload = &bytes[16..];
        let mut payload = payload.to_vec();
        if let Some(result) = self.find(Direction::Output, &stream_id, |channel| channel.unpack_into(&mut payload)) {
            return result.map(|ptr| (stream_id, ptr));
        }
        self.find(Direction::Input, &stream_id, |channel| channel.unpack_into(&mut payload))
            .ok_or(IoError::SerdeFailure("no channel for stream-id"))?
            .map(|ptr| (stream_id, ptr))
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
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
    fn create_then_find_then_destroy() {
        with_heap(1 << 16, |heap| {
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0xF1; 16]);
            reg.create(heap, Direction::Output, id, 0, 100, 8, None).unwrap();
            let found = reg.find(Direction::Output, &id, |c| c.element_size());
            assert_eq!(found, Some(8));
            reg.destroy(Direction::Output, &id).unwrap();
            assert_eq!(reg.find(Direction::Output, &id, |c| c.element_size()), None);
        });
    }

    #[test]
    fn duplicate_stream_id_in_same_direction_is_rejected() {
        with_heap(1 << 16, |heap| {
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0x01; 16]);
            reg.create(heap, Direction::Input, id, 0, 10, 4, None).unwrap();
            let err = reg.create(heap, Direction::Input, id, 0, 10, 4, None).unwrap_err();
            assert!(matches!(err, IoError::DuplicateStreamId));
        });
    }

    #[test]
    fn same_stream_id_may_exist_in_both_directions() {
        with_heap(1 << 16, |heap| {
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0x02; 16]);
            reg.create(heap, Direction::Input, id, 0, 10, 4, None).unwrap();
            reg.create(heap, Direction::Output, id, 0, 10, 4, None).unwrap();
        });
    }

    #[test]
    fn destroy_of_unknown_stream_id_is_a_no_op() {
        with_heap(1 << 16, |heap| {
            let _ = heap;
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0x03; 16]);
            assert!(reg.destroy(Direction::Output, &id).is_ok());
        });
    }

    #[test]
    fn local_round_trip_reserve_write_submit_drain() {
        with_heap(1 << 16, |heap| {
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0xF1, 0xF1, 0xF1, 0xF1, 0xF1, 0xF1, 0xF1, 0xF1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1, 0xB1]);
            reg.create(heap, Direction::Output, id, 0, 100, 8, None).unwrap();
            reg.find(Direction::Output, &id, |channel| {
                channel
                    .enqueue(|buf| buf.copy_from_slice(&[0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]))
                    .unwrap();
            });
            let mut seen: Vec<(StreamId, Vec<u8>)> = Vec::new();
            let n = reg.drain_outputs(|_channel, sid, payload| seen.push((*sid, payload.to_vec())));
            assert_eq!(n, 1);
            assert_eq!(seen[0].0, id);
            assert_eq!(seen[0].1, vec![0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]);
        });
    }

    #[test]
    fn send_msg_rejects_oversized_payload() {
        with_heap(1 << 16, |heap| {
            let mut reg = ChannelRegistry::new();
            let id = StreamId::from_bytes([0x09; 16]);
            reg.create(heap, Direction::Input, id, 0, 10, 4, None).unwrap();
            let err = reg.send_msg(&id, &[0u8; 8]).unwrap_err();
            assert!(matches!(err, IoError::CapacityExceeded));
        });
    }
}
