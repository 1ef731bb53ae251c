// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{ByteArray, DecodeError, DecodePacket, FixedHeader, Packet, PacketType, QoS};

use crate::error::{Error, ErrorKind};

/// Outcome of one [`Assembler::poll`] call.
pub enum FrameOutcome {
    /// Not enough bytes buffered yet; call again after the next transport
    /// read.
    Pending,

    /// A full packet is available; `bytes` is the exact wire encoding
    /// (fixed header included), already drained from the assembler.
    Complete { packet_type: PacketType, bytes: Vec<u8> },

    /// A PUBLISH whose declared length exceeds the input buffer. `header`
    /// holds everything read so far (fixed header + as much of the
    /// variable header as fit); `total_len` is the full packet length
    /// (header + payload) the caller must keep streaming until
    /// `current_data_offset` reaches it.
    Oversized { header: Vec<u8>, total_len: usize },
}

/// Reassembles packets out of however many bytes the transport handed over
/// per read. Retains enough state across calls that a partial read never
/// re-parses the first byte.
#[derive(Debug, Default)]
pub struct Assembler {
    buffer: Vec<u8>,
}

impl Assembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read transport bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Attempt to produce one complete frame out of the buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns a `Protocol` error on a malformed fixed header (bad flags,
    /// unknown packet type, or a remaining-length encoding longer than 4
    /// bytes); these are framing failures, not "need more bytes".
    pub fn poll(&mut self, input_buffer_size: usize) -> Result<FrameOutcome, Error> {
        if self.buffer.is_empty() {
            return Ok(FrameOutcome::Pending);
        }

        let fixed_header = {
            let mut ba = ByteArray::new(&self.buffer);
            match FixedHeader::decode(&mut ba) {
                Ok(fh) => fh,
                Err(DecodeError::OutOfRangeError) => return Ok(FrameOutcome::Pending),
                Err(err) => {
                    return Err(Error::from_string(
                        ErrorKind::Protocol,
                        format!("malformed fixed header: {err:?}"),
                    ))
                }
            }
        };

        let header_len = fixed_header.bytes();
        let total_len = header_len + fixed_header.remaining_length();

        if self.buffer.len() >= total_len {
            let bytes = self.buffer.drain(..total_len).collect();
            return Ok(FrameOutcome::Complete {
                packet_type: fixed_header.packet_type(),
                bytes,
            });
        }

        if total_len > input_buffer_size {
            if let PacketType::Publish { qos, .. } = fixed_header.packet_type() {
                // Oversized PUBLISH: hand back whatever prefix is already
                // buffered so the caller can parse topic/packet-id out of it
                // and stream the remainder directly, without ever holding
                // the full payload in memory at once. The caller needs at
                // least the fixed header, the topic-length prefix, the
                // topic itself, and (for qos>0) the packet id before it can
                // decode any of that, so don't hand back a prefix shorter
                // than that even if it means buffering past
                // `input_buffer_size` first.
                if self.buffer.len() < header_len + 2 {
                    return Ok(FrameOutcome::Pending);
                }
                let topic_len =
                    usize::from(u16::from_be_bytes([self.buffer[header_len], self.buffer[header_len + 1]]));
                let packet_id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
                let prefix_len = header_len + 2 + topic_len + packet_id_len;
                if self.buffer.len() < prefix_len {
                    return Ok(FrameOutcome::Pending);
                }
                let available = self.buffer.len().min(input_buffer_size).max(prefix_len);
                let header = self.buffer.drain(..available).collect();
                return Ok(FrameOutcome::Oversized { header, total_len });
            }
        }

        Ok(FrameOutcome::Pending)
    }

    /// Drain up to `max` raw bytes, for streaming the tail of an oversized
    /// PUBLISH payload after `poll` has returned `Oversized`.
    pub fn take_raw(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.buffer.len());
        self.buffer.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v3::{PingRequestPacket, PublishPacket};
    use codec::{EncodePacket, PacketId};

    #[test]
    fn test_pending_on_empty_buffer() {
        let mut assembler = Assembler::new();
        assert!(matches!(assembler.poll(1024).unwrap(), FrameOutcome::Pending));
    }

    #[test]
    fn test_complete_frame_once_fully_buffered() {
        let mut buf = Vec::new();
        PingRequestPacket::new().encode(&mut buf).unwrap();

        let mut assembler = Assembler::new();
        assembler.feed(&buf[..1]);
        assert!(matches!(assembler.poll(1024).unwrap(), FrameOutcome::Pending));

        assembler.feed(&buf[1..]);
        match assembler.poll(1024).unwrap() {
            FrameOutcome::Complete { packet_type, bytes } => {
                assert_eq!(packet_type, PacketType::PingRequest);
                assert_eq!(bytes, buf);
            }
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_oversized_publish_waits_for_full_prefix_before_streaming() {
        let mut packet = PublishPacket::new("t/very/long/topic", QoS::AtLeastOnce, &[0xAB; 4096]).unwrap();
        packet.set_packet_id(PacketId::new(7));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        // Small enough that the 4096-byte payload makes this PUBLISH
        // oversized, but large enough to exercise the gating below.
        let input_buffer_size = 64;

        let mut assembler = Assembler::new();
        let header_len = FixedHeader::decode(&mut ByteArray::new(&buf)).unwrap().bytes();
        let topic_len = "t/very/long/topic".len();
        let prefix_len = header_len + 2 + topic_len + 2;

        // Feed one byte at a time up to (but not including) the full
        // prefix: every call must report Pending, never Oversized.
        for i in 0..prefix_len {
            assembler.feed(&buf[i..=i]);
            assert!(
                matches!(assembler.poll(input_buffer_size).unwrap(), FrameOutcome::Pending),
                "expected Pending at byte {i} of {prefix_len}",
            );
        }

        // The next byte completes the prefix; now Oversized must fire.
        assembler.feed(&buf[prefix_len..=prefix_len]);
        match assembler.poll(input_buffer_size).unwrap() {
            FrameOutcome::Oversized { header, total_len } => {
                assert!(header.len() >= prefix_len);
                assert_eq!(total_len, buf.len());
            }
            FrameOutcome::Pending => panic!("expected Oversized, got Pending"),
            FrameOutcome::Complete { .. } => panic!("expected Oversized, got Complete"),
        }
    }
}
