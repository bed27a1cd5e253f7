// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// 16-byte opaque channel identifier (§3 "Stream-id"). Uniqueness is per
// direction per primary registry: an input and an output channel may
// share an id, but two channels in the same direction may not.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct StreamId(pub [u8; 16]);

impl StreamId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse a stream-id from a byte slice, as found at the front of a
    /// packed channel message (§6 "stream_id[16] || serde_payload[N]").
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Self(arr))
    }

    fn hash64(&self) -> u64 {
        crate::shm_name::fnv1a_64(&self.0)
    }

    pub fn bucket_hash(&self) -> u64 {
        self.hash64()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let id = StreamId::from_bytes([0xF1; 16]);
        let mut buf = [0u8; 20];
        buf[..16].copy_from_slice(id.as_bytes());
        assert_eq!(StreamId::from_slice(&buf), Some(id));
    }

    #[test]
    fn short_slice_is_rejected() {
        assert_eq!(StreamId::from_slice(&[0u8; 8]), None);
    }

    #[test]
    fn distinct_ids_hash_differently_with_overwhelming_probability() {
        let a = StreamId::from_bytes([0x00; 16]);
        let b = StreamId::from_bytes([0x01; 16]);
        assert_ne!(a.bucket_hash(), b.bucket_hash());
    }
}
