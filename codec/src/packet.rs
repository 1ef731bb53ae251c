// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{
    v3, v5, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketType, ProtocolLevel, VarIntError,
};

/// A decoded MQTT 3.1/3.1.1 control packet.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub enum V3Packet {
    Connect(v3::ConnectPacket),
    ConnectAck(v3::ConnectAckPacket),
    Publish(v3::PublishPacket),
    PublishAck(v3::PublishAckPacket),
    PublishReceived(v3::PublishReceivedPacket),
    PublishRelease(v3::PublishReleasePacket),
    PublishComplete(v3::PublishCompletePacket),
    Subscribe(v3::SubscribePacket),
    SubscribeAck(v3::SubscribeAckPacket),
    Unsubscribe(v3::UnsubscribePacket),
    UnsubscribeAck(v3::UnsubscribeAckPacket),
    PingRequest(v3::PingRequestPacket),
    PingResponse(v3::PingResponsePacket),
    Disconnect(v3::DisconnectPacket),
}

impl V3Packet {
    fn decode_typed(ba: &mut ByteArray, packet_type: PacketType) -> Result<Self, DecodeError> {
        match packet_type {
            PacketType::Connect => Ok(Self::Connect(v3::ConnectPacket::decode(ba)?)),
            PacketType::ConnectAck => Ok(Self::ConnectAck(v3::ConnectAckPacket::decode(ba)?)),
            PacketType::Publish { .. } => Ok(Self::Publish(v3::PublishPacket::decode(ba)?)),
            PacketType::PublishAck => Ok(Self::PublishAck(v3::PublishAckPacket::decode(ba)?)),
            PacketType::PublishReceived => {
                Ok(Self::PublishReceived(v3::PublishReceivedPacket::decode(ba)?))
            }
            PacketType::PublishRelease => {
                Ok(Self::PublishRelease(v3::PublishReleasePacket::decode(ba)?))
            }
            PacketType::PublishComplete => Ok(Self::PublishComplete(
                v3::PublishCompletePacket::decode(ba)?,
            )),
            PacketType::Subscribe => Ok(Self::Subscribe(v3::SubscribePacket::decode(ba)?)),
            PacketType::SubscribeAck => Ok(Self::SubscribeAck(v3::SubscribeAckPacket::decode(ba)?)),
            PacketType::Unsubscribe => Ok(Self::Unsubscribe(v3::UnsubscribePacket::decode(ba)?)),
            PacketType::UnsubscribeAck => {
                Ok(Self::UnsubscribeAck(v3::UnsubscribeAckPacket::decode(ba)?))
            }
            PacketType::PingRequest => Ok(Self::PingRequest(v3::PingRequestPacket::decode(ba)?)),
            PacketType::PingResponse => Ok(Self::PingResponse(v3::PingResponsePacket::decode(ba)?)),
            PacketType::Disconnect => Ok(Self::Disconnect(v3::DisconnectPacket::decode(ba)?)),
            PacketType::Auth => Err(DecodeError::InvalidPacketType),
        }
    }
}

impl EncodePacket for V3Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
        }
    }
}

impl Packet for V3Packet {
    fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::PublishAck(p) => p.packet_type(),
            Self::PublishReceived(p) => p.packet_type(),
            Self::PublishRelease(p) => p.packet_type(),
            Self::PublishComplete(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        match self {
            Self::Connect(p) => p.bytes(),
            Self::ConnectAck(p) => p.bytes(),
            Self::Publish(p) => p.bytes(),
            Self::PublishAck(p) => p.bytes(),
            Self::PublishReceived(p) => p.bytes(),
            Self::PublishRelease(p) => p.bytes(),
            Self::PublishComplete(p) => p.bytes(),
            Self::Subscribe(p) => p.bytes(),
            Self::SubscribeAck(p) => p.bytes(),
            Self::Unsubscribe(p) => p.bytes(),
            Self::UnsubscribeAck(p) => p.bytes(),
            Self::PingRequest(p) => p.bytes(),
            Self::PingResponse(p) => p.bytes(),
            Self::Disconnect(p) => p.bytes(),
        }
    }
}

/// A decoded MQTT 5.0 control packet.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub enum V5Packet {
    Connect(v5::ConnectPacket),
    ConnectAck(v5::ConnectAckPacket),
    Publish(v5::PublishPacket),
    PublishAck(v5::PublishAckPacket),
    PublishReceived(v5::PublishReceivedPacket),
    PublishRelease(v5::PublishReleasePacket),
    PublishComplete(v5::PublishCompletePacket),
    Subscribe(v5::SubscribePacket),
    SubscribeAck(v5::SubscribeAckPacket),
    Unsubscribe(v5::UnsubscribePacket),
    UnsubscribeAck(v5::UnsubscribeAckPacket),
    PingRequest(v5::PingRequestPacket),
    PingResponse(v5::PingResponsePacket),
    Disconnect(v5::DisconnectPacket),
    Auth(v5::AuthPacket),
}

impl V5Packet {
    fn decode_typed(ba: &mut ByteArray, packet_type: PacketType) -> Result<Self, DecodeError> {
        match packet_type {
            PacketType::Connect => Ok(Self::Connect(v5::ConnectPacket::decode(ba)?)),
            PacketType::ConnectAck => Ok(Self::ConnectAck(v5::ConnectAckPacket::decode(ba)?)),
            PacketType::Publish { .. } => Ok(Self::Publish(v5::PublishPacket::decode(ba)?)),
            PacketType::PublishAck => Ok(Self::PublishAck(v5::PublishAckPacket::decode(ba)?)),
            PacketType::PublishReceived => {
                Ok(Self::PublishReceived(v5::PublishReceivedPacket::decode(ba)?))
            }
            PacketType::PublishRelease => {
                Ok(Self::PublishRelease(v5::PublishReleasePacket::decode(ba)?))
            }
            PacketType::PublishComplete => Ok(Self::PublishComplete(
                v5::PublishCompletePacket::decode(ba)?,
            )),
            PacketType::Subscribe => Ok(Self::Subscribe(v5::SubscribePacket::decode(ba)?)),
            PacketType::SubscribeAck => Ok(Self::SubscribeAck(v5::SubscribeAckPacket::decode(ba)?)),
            PacketType::Unsubscribe => Ok(Self::Unsubscribe(v5::UnsubscribePacket::decode(ba)?)),
            PacketType::UnsubscribeAck => {
                Ok(Self::UnsubscribeAck(v5::UnsubscribeAckPacket::decode(ba)?))
            }
            PacketType::PingRequest => Ok(Self::PingRequest(v5::PingRequestPacket::decode(ba)?)),
            PacketType::PingResponse => Ok(Self::PingResponse(v5::PingResponsePacket::decode(ba)?)),
            PacketType::Disconnect => Ok(Self::Disconnect(v5::DisconnectPacket::decode(ba)?)),
            PacketType::Auth => Ok(Self::Auth(v5::AuthPacket::decode(ba)?)),
        }
    }
}

impl EncodePacket for V5Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
            Self::Auth(p) => p.encode(buf),
        }
    }
}

impl Packet for V5Packet {
    fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::PublishAck(p) => p.packet_type(),
            Self::PublishReceived(p) => p.packet_type(),
            Self::PublishRelease(p) => p.packet_type(),
            Self::PublishComplete(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
            Self::Auth(p) => p.packet_type(),
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        match self {
            Self::Connect(p) => p.bytes(),
            Self::ConnectAck(p) => p.bytes(),
            Self::Publish(p) => p.bytes(),
            Self::PublishAck(p) => p.bytes(),
            Self::PublishReceived(p) => p.bytes(),
            Self::PublishRelease(p) => p.bytes(),
            Self::PublishComplete(p) => p.bytes(),
            Self::Subscribe(p) => p.bytes(),
            Self::SubscribeAck(p) => p.bytes(),
            Self::Unsubscribe(p) => p.bytes(),
            Self::UnsubscribeAck(p) => p.bytes(),
            Self::PingRequest(p) => p.bytes(),
            Self::PingResponse(p) => p.bytes(),
            Self::Disconnect(p) => p.bytes(),
            Self::Auth(p) => p.bytes(),
        }
    }
}

/// A decoded MQTT control packet tagged with the protocol generation it was read as.
///
/// Decoding a packet requires knowing which wire dialect to speak before the packet
/// type byte even tells you which packet it is, since v3.x and v5.0 diverge on
/// variable header layout (properties, reason codes) for nearly every packet type.
/// [`VersionedPacket::decode`] takes the negotiated [`ProtocolLevel`] as a parameter
/// for this reason; callers that don't yet know the level (e.g. reading the initial
/// CONNECT) should decode a [`v3::ConnectPacket`] or [`v5::ConnectPacket`] directly
/// instead, then dispatch on its `protocol_level()`.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedPacket {
    V3(V3Packet),
    V5(V5Packet),
}

impl VersionedPacket {
    /// Decode a single packet from `ba`, using `protocol_level` to pick the v3.x or
    /// v5.0 wire format.
    ///
    /// # Errors
    ///
    /// Returns error if the fixed header or packet body is malformed, or if the
    /// packet type is not legal for the given protocol level (e.g. AUTH under v3.1.1).
    pub fn decode(ba: &mut ByteArray, protocol_level: ProtocolLevel) -> Result<Self, DecodeError> {
        let mut peek = *ba;
        let fixed_header = FixedHeader::decode(&mut peek)?;
        if !fixed_header.is_valid_header(protocol_level) {
            return Err(DecodeError::InvalidPacketType);
        }
        let packet_type = fixed_header.packet_type();
        match protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => {
                V3Packet::decode_typed(ba, packet_type).map(Self::V3)
            }
            ProtocolLevel::V5 => V5Packet::decode_typed(ba, packet_type).map(Self::V5),
        }
    }
}

impl EncodePacket for VersionedPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::V3(p) => p.encode(buf),
            Self::V5(p) => p.encode(buf),
        }
    }
}

impl Packet for VersionedPacket {
    fn packet_type(&self) -> PacketType {
        match self {
            Self::V3(p) => p.packet_type(),
            Self::V5(p) => p.packet_type(),
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        match self {
            Self::V3(p) => p.bytes(),
            Self::V5(p) => p.bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_v3_ping_request() {
        let buf = [0b1100_0000, 0x00];
        let mut ba = ByteArray::new(&buf);
        let packet = VersionedPacket::decode(&mut ba, ProtocolLevel::V4).unwrap();
        assert_eq!(
            packet,
            VersionedPacket::V3(V3Packet::PingRequest(v3::PingRequestPacket::new()))
        );
    }

    #[test]
    fn test_decode_v5_ping_request() {
        let buf = [0b1100_0000, 0x00];
        let mut ba = ByteArray::new(&buf);
        let packet = VersionedPacket::decode(&mut ba, ProtocolLevel::V5).unwrap();
        assert_eq!(
            packet,
            VersionedPacket::V5(V5Packet::PingRequest(v5::PingRequestPacket::new()))
        );
    }

    #[test]
    fn test_decode_auth_rejected_under_v4() {
        // AUTH packet type byte (15 << 4 = 0xF0) with zero remaining length.
        let buf = [0b1111_0000, 0x00];
        let mut ba = ByteArray::new(&buf);
        let result = VersionedPacket::decode(&mut ba, ProtocolLevel::V4);
        assert!(result.is_err());
    }
}
