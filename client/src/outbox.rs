// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::VecDeque;

use codec::{PacketId, PacketType, QoS};

/// Lifecycle of one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Queued,
    Transmitted,
    Acknowledged,
    Expired,
}

/// A pending outbound packet, tracked until its matching ack (or expiry)
/// removes it.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub packet_id: PacketId,
    pub packet_type: PacketType,
    pub qos: QoS,
    pub buffer: Vec<u8>,
    pub state: OutboxState,
    pub created_tick: u64,
    pub last_tick: u64,
    /// Offset + length of a fragmented PUBLISH tail still owed to the peer.
    pub remaining: Option<(usize, usize)>,
}

/// Holds outbound QoS>0 PUBLISH/SUBSCRIBE/UNSUBSCRIBE packets between
/// enqueue and terminal ack.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: VecDeque<OutboxEntry>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find_index(&self, id: PacketId) -> Option<usize> {
        self.entries.iter().position(|e| e.packet_id == id)
    }

    /// Append a new entry in state `Queued`.
    pub fn enqueue(
        &mut self,
        buffer: Vec<u8>,
        packet_id: PacketId,
        packet_type: PacketType,
        qos: QoS,
        tick: u64,
    ) {
        self.entries.push_back(OutboxEntry {
            packet_id,
            packet_type,
            qos,
            buffer,
            state: OutboxState::Queued,
            created_tick: tick,
            last_tick: tick,
            remaining: None,
        });
    }

    /// Like [`Self::enqueue`], but the entry also carries the offset/length
    /// of a fragmented PUBLISH tail still to be streamed.
    pub fn enqueue_oversized(
        &mut self,
        buffer: Vec<u8>,
        packet_id: PacketId,
        packet_type: PacketType,
        qos: QoS,
        remaining_offset: usize,
        remaining_len: usize,
        tick: u64,
    ) {
        self.entries.push_back(OutboxEntry {
            packet_id,
            packet_type,
            qos,
            buffer,
            state: OutboxState::Queued,
            created_tick: tick,
            last_tick: tick,
            remaining: Some((remaining_offset, remaining_len)),
        });
    }

    /// Oldest entry in `state`, if any.
    #[must_use]
    pub fn dequeue(&mut self, state: OutboxState) -> Option<&OutboxEntry> {
        self.entries.iter().find(|e| e.state == state)
    }

    #[must_use]
    pub fn get(&self, id: PacketId) -> Option<&OutboxEntry> {
        self.entries.iter().find(|e| e.packet_id == id)
    }

    /// Transition `id` to `new_state`. No-op if `id` is absent.
    pub fn set_pending(&mut self, id: PacketId, new_state: OutboxState) {
        if let Some(index) = self.find_index(id) {
            self.entries[index].state = new_state;
        }
    }

    /// Refresh the last-activity tick, suppressing early retransmit.
    pub fn set_tick(&mut self, id: PacketId, tick: u64) {
        if let Some(index) = self.find_index(id) {
            self.entries[index].last_tick = tick;
        }
    }

    /// Remove the entry whose id **and** type both match. A stray ack for a
    /// reused id that doesn't match the stored type is a no-op.
    pub fn delete(&mut self, id: PacketId, packet_type: PacketType) {
        self.entries
            .retain(|e| !(e.packet_id == id && e.packet_type == packet_type));
    }

    pub fn delete_by_type(&mut self, packet_type: PacketType) {
        self.entries.retain(|e| e.packet_type != packet_type);
    }

    pub fn delete_all(&mut self) {
        self.entries.clear();
    }

    /// Remove and count entries older than `now - timeout`.
    pub fn delete_expired(&mut self, now: u64, timeout: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| now.saturating_sub(e.created_tick) <= timeout);
        before - self.entries.len()
    }

    /// Remove and return the id of a single expired entry, for callers that
    /// want to emit one `Deleted` event per removal.
    pub fn delete_single_expired(&mut self, now: u64, timeout: u64) -> Option<PacketId> {
        let index = self
            .entries
            .iter()
            .position(|e| now.saturating_sub(e.created_tick) > timeout)?;
        Some(self.entries.remove(index)?.packet_id)
    }

    /// Sum of buffer sizes across all entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.iter().map(|e| e.buffer.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::PacketType;

    fn publish_id(id: u16) -> PacketId {
        PacketId::new(id)
    }

    #[test]
    fn test_enqueue_then_size() {
        let mut outbox = Outbox::new();
        outbox.enqueue(vec![0u8; 10], publish_id(1), PacketType::Publish{dup:false,qos:QoS::AtLeastOnce,retain:false}, QoS::AtLeastOnce, 0);
        outbox.enqueue(vec![0u8; 5], publish_id(2), PacketType::Publish{dup:false,qos:QoS::AtLeastOnce,retain:false}, QoS::AtLeastOnce, 1);
        assert_eq!(outbox.size(), 15);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_dequeue_is_fifo_within_state() {
        let mut outbox = Outbox::new();
        let pt = PacketType::Publish{dup:false,qos:QoS::AtLeastOnce,retain:false};
        outbox.enqueue(vec![1], publish_id(1), pt, QoS::AtLeastOnce, 0);
        outbox.enqueue(vec![2], publish_id(2), pt, QoS::AtLeastOnce, 1);
        let first = outbox.dequeue(OutboxState::Queued).unwrap().packet_id;
        assert_eq!(first, publish_id(1));
    }

    #[test]
    fn test_delete_requires_matching_type() {
        let mut outbox = Outbox::new();
        let pt = PacketType::Publish{dup:false,qos:QoS::AtLeastOnce,retain:false};
        outbox.enqueue(vec![1], publish_id(1), pt, QoS::AtLeastOnce, 0);
        outbox.delete(publish_id(1), PacketType::Subscribe);
        assert_eq!(outbox.len(), 1);
        outbox.delete(publish_id(1), pt);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_delete_expired_counts_and_preserves_order() {
        let mut outbox = Outbox::new();
        let pt = PacketType::Publish{dup:false,qos:QoS::AtLeastOnce,retain:false};
        outbox.enqueue(vec![1], publish_id(1), pt, QoS::AtLeastOnce, 0);
        outbox.enqueue(vec![2], publish_id(2), pt, QoS::AtLeastOnce, 100);
        let count = outbox.delete_expired(1000, 30);
        assert_eq!(count, 1);
        assert_eq!(outbox.dequeue(OutboxState::Queued).unwrap().packet_id, publish_id(2));
    }
}
