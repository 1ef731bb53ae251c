// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::Rng;
use std::fmt;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, U16Data};

/// 16-bit nonzero identifier carried in QoS>0 PUBLISH/SUBSCRIBE/UNSUBSCRIBE
/// for matching acks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    /// Build a `PacketId` from a raw value. `0` is reserved for "no id"
    /// (QoS 0 PUBLISH carries no packet id at all).
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PacketId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(Self(U16Data::decode(ba)?.value()))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        U16Data::new(self.0).encode(buf)
    }
}

/// How a connection mints new packet ids for outbound QoS>0
/// PUBLISH/SUBSCRIBE/UNSUBSCRIBE packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketIdAllocMode {
    /// Incremental successor modulo 2^16, skipping 0 (the default).
    Incremental,

    /// Random pick, to avoid collisions with a peer that reuses ids across
    /// sessions. Still skips 0 and retries on collision with `in_use`.
    Random,
}

/// Stateful packet id allocator held by one connection.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    mode: PacketIdAllocMode,
    last: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self {
            mode: PacketIdAllocMode::Incremental,
            last: 0,
        }
    }
}

impl PacketIdAllocator {
    #[must_use]
    pub fn new(mode: PacketIdAllocMode) -> Self {
        Self { mode, last: 0 }
    }

    /// Allocate the next id, never reusing one present in `in_use`.
    pub fn next<F>(&mut self, in_use: F) -> PacketId
    where
        F: Fn(u16) -> bool,
    {
        match self.mode {
            PacketIdAllocMode::Incremental => loop {
                self.last = self.last.wrapping_add(1);
                if self.last == 0 {
                    self.last = 1;
                }
                if !in_use(self.last) {
                    return PacketId(self.last);
                }
            },
            PacketIdAllocMode::Random => {
                let mut rng = rand::thread_rng();
                loop {
                    let candidate: u16 = rng.gen_range(1..=u16::MAX);
                    if !in_use(candidate) {
                        return PacketId(candidate);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_skips_zero() {
        let mut alloc = PacketIdAllocator::new(PacketIdAllocMode::Incremental);
        let mut last = 0u16;
        for _ in 0..5 {
            let id = alloc.next(|_| false);
            assert_ne!(id.value(), 0);
            assert!(id.value() > last || last == u16::MAX);
            last = id.value();
        }
    }

    #[test]
    fn test_incremental_wraps_past_max() {
        let mut alloc = PacketIdAllocator {
            mode: PacketIdAllocMode::Incremental,
            last: u16::MAX,
        };
        let id = alloc.next(|_| false);
        assert_eq!(id.value(), 1);
    }

    #[test]
    fn test_skips_in_use() {
        let mut alloc = PacketIdAllocator::new(PacketIdAllocMode::Incremental);
        let id = alloc.next(|v| v == 1);
        assert_eq!(id.value(), 2);
    }
}
