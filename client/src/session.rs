// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::{Duration, Instant};

use tokio::time;

use codec::{
    v3, v5, ByteArray, ConnectFlags, DecodePacket, EncodePacket, FixedHeader, PacketId,
    PacketIdAllocator, PacketType, ProtocolLevel, QoS, U16Data, V3Packet, V5Packet, VersionedPacket,
};

use crate::assembler::{Assembler, FrameOutcome};
use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind};
use crate::event::{
    ConnectedInfo, DataChunk, Event, EventSink, PublishedInfo, SubscribedInfo, UnsubscribedInfo,
};
use crate::outbox::{Outbox, OutboxState};
use crate::status::ClientStatus;
use crate::topic_alias::{FlowControl, TopicAliasTable};
use crate::transport::Transport;

const OUTBOX_EXPIRED_TIMEOUT: Duration = Duration::from_secs(30);

fn encode<P: EncodePacket>(packet: &P) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    Ok(buf)
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Drives the session state machine. One instance per client; owned
/// exclusively by the worker task.
pub struct Session {
    config: ClientConfig,
    status: ClientStatus,
    transport: Option<Transport>,
    assembler: Assembler,
    outbox: Outbox,
    packet_ids: PacketIdAllocator,
    peer_topic_alias: TopicAliasTable,
    own_topic_alias: TopicAliasTable,
    flow_control: FlowControl,
    connected_info: Option<ConnectedInfo>,

    started_at: Instant,
    keepalive_tick: u64,
    reconnect_tick: u64,
    refresh_connection_tick: u64,
    last_retransmit_scan: u64,
    wait_for_ping_resp: bool,
    wait_timeout: Duration,

    disconnect_requested: bool,
    reconnect_requested: bool,
}

impl Session {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            status: ClientStatus::Init,
            transport: None,
            assembler: Assembler::new(),
            outbox: Outbox::new(),
            packet_ids: PacketIdAllocator::default(),
            peer_topic_alias: TopicAliasTable::new(config.v5.topic_alias_maximum),
            own_topic_alias: TopicAliasTable::new(0),
            flow_control: FlowControl::new(0),
            connected_info: None,
            started_at: Instant::now(),
            keepalive_tick: 0,
            reconnect_tick: 0,
            refresh_connection_tick: 0,
            last_retransmit_scan: 0,
            wait_for_ping_resp: false,
            wait_timeout: config.reconnect_timeout,
            disconnect_requested: false,
            reconnect_requested: false,
            config,
        }
    }

    #[must_use]
    pub const fn status(&self) -> ClientStatus {
        self.status
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn request_disconnect(&mut self) {
        self.disconnect_requested = true;
    }

    pub fn request_reconnect(&mut self) {
        self.reconnect_requested = true;
    }

    /// Run one iteration of the worker loop, dispatching on the current
    /// state.
    ///
    /// # Errors
    ///
    /// Propagates transport/protocol errors the caller did not already
    /// have a chance to turn into an `Error` event.
    pub async fn step(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        match self.status {
            ClientStatus::Init => self.step_init(sink).await,
            ClientStatus::Connected => self.step_connected(sink).await,
            ClientStatus::WaitReconnect => self.step_wait_reconnect(sink),
            ClientStatus::Disconnected => Ok(()),
        }
    }

    async fn step_init(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        sink.on_event(Event::BeforeConnect);

        let transport = match Transport::connect(&self.config).await {
            Ok(transport) => transport,
            Err(err) => {
                sink.on_event(Event::Error(err));
                self.abort();
                return Ok(());
            }
        };
        self.transport = Some(transport);

        let connect_bytes = match self.build_connect() {
            Ok(bytes) => bytes,
            Err(err) => {
                sink.on_event(Event::Error(err));
                self.abort();
                return Ok(());
            }
        };
        if let Err(err) = self.write(&connect_bytes).await {
            sink.on_event(Event::Error(err));
            self.abort();
            return Ok(());
        }

        match self.wait_for_connack().await {
            Ok(info) => {
                self.keepalive_tick = self.now_ms();
                self.refresh_connection_tick = self.now_ms();
                self.flow_control = FlowControl::new(info.receive_maximum);
                self.own_topic_alias = TopicAliasTable::new(info.topic_alias_maximum);
                self.connected_info = Some(info.clone());
                self.status = ClientStatus::Connected;
                sink.on_event(Event::Connected(info));
                Ok(())
            }
            Err(err) => {
                sink.on_event(Event::Error(err));
                self.abort();
                Ok(())
            }
        }
    }

    fn build_connect(&self) -> Result<Vec<u8>, Error> {
        let client_id = self.config.resolved_client_id();
        let keep_alive = self.config.wire_keep_alive();

        match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => {
                let mut packet = v3::ConnectPacket::new(&client_id)?;
                packet.set_protcol_level(self.config.protocol_level);
                packet.set_keep_alive(keep_alive);

                let mut flags = ConnectFlags::default();
                flags.set_clean_session(self.config.clean_session);
                if let Some(will) = &self.config.will {
                    flags.set_will(true);
                    flags.set_will_qos(will.qos);
                    flags.set_will_retain(will.retain);
                    packet.set_will_topic(&will.topic)?;
                    packet.set_will_message(&will.payload)?;
                }
                if let Some(username) = &self.config.username {
                    flags.set_has_username(true);
                    packet.set_username(username)?;
                }
                if let Some(password) = &self.config.password {
                    flags.set_has_password(true);
                    packet.set_password(password.as_bytes())?;
                }
                packet.set_connect_flags(flags);
                encode(&packet)
            }
            ProtocolLevel::V5 => {
                let mut packet = v5::ConnectPacket::new(&client_id)?;
                packet.set_keep_alive(keep_alive);
                packet.set_clean_session(self.config.clean_session);
                if let Some(will) = &self.config.will {
                    packet.set_will(true);
                    packet.set_will_qos(will.qos);
                    packet.set_will_retain(will.retain);
                    packet.set_will_topic(&will.topic)?;
                    packet.set_will_message(&will.payload)?;
                }
                if let Some(username) = &self.config.username {
                    packet.set_username(Some(username.as_str()))?;
                }
                if let Some(password) = &self.config.password {
                    packet.set_password(Some(password.as_bytes()))?;
                }
                encode(&packet)
            }
        }
    }

    async fn wait_for_connack(&mut self) -> Result<ConnectedInfo, Error> {
        let deadline = self.config.network_timeout;
        let start = Instant::now();
        loop {
            if start.elapsed() > deadline {
                return Err(Error::new(ErrorKind::Transport, "timed out waiting for CONNACK"));
            }
            self.read_once().await?;
            match self.assembler.poll(self.config.input_buffer_size)? {
                FrameOutcome::Complete { packet_type, bytes } => {
                    if packet_type != PacketType::ConnectAck {
                        return Err(Error::new(ErrorKind::Protocol, "expected CONNACK"));
                    }
                    return self.parse_connack(&bytes);
                }
                FrameOutcome::Pending | FrameOutcome::Oversized { .. } => continue,
            }
        }
    }

    fn parse_connack(&self, bytes: &[u8]) -> Result<ConnectedInfo, Error> {
        let mut ba = ByteArray::new(bytes);
        match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => {
                let ack = v3::ConnectAckPacket::decode(&mut ba)?;
                if ack.return_code() != v3::ConnectReturnCode::Accepted {
                    return Err(Error::new(ErrorKind::ConnectionRefused, "CONNECT refused"));
                }
                Ok(ConnectedInfo {
                    session_present: ack.session_present(),
                    maximum_qos: QoS::ExactOnce,
                    retain_available: true,
                    receive_maximum: 65535,
                    wildcard_subscription_available: true,
                    subscription_identifiers_available: true,
                    shared_subscription_available: true,
                    ..ConnectedInfo::default()
                })
            }
            ProtocolLevel::V5 => {
                let ack = v5::ConnectAckPacket::decode(&mut ba)?;
                if ack.reason_code() != v5::ReasonCode::Success {
                    return Err(Error::new(ErrorKind::ConnectionRefused, "CONNECT refused"));
                }
                Ok(self.connack_properties_to_info(ack.session_present(), ack.properties()))
            }
        }
    }

    fn connack_properties_to_info(
        &self,
        session_present: bool,
        properties: &v5::Properties,
    ) -> ConnectedInfo {
        let mut info = ConnectedInfo {
            session_present,
            maximum_qos: QoS::ExactOnce,
            retain_available: true,
            receive_maximum: 65535,
            server_keep_alive: Some(self.config.wire_keep_alive()),
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: true,
            ..ConnectedInfo::default()
        };
        for prop in properties.props() {
            match prop {
                v5::Property::ReceiveMaximum(v) => info.receive_maximum = v.value(),
                v5::Property::MaximumQoS(v) => info.maximum_qos = *v,
                v5::Property::RetainAvailable(v) => info.retain_available = v.value(),
                v5::Property::MaximumPacketSize(v) => info.maximum_packet_size = v.value(),
                v5::Property::AssignedClientIdentifier(v) => {
                    info.assigned_client_id = Some(v.as_ref().to_owned());
                }
                v5::Property::TopicAliasMaximum(v) => info.topic_alias_maximum = v.value(),
                v5::Property::WildcardSubscriptionAvailable(v) => {
                    info.wildcard_subscription_available = v.value();
                }
                v5::Property::SubscriptionIdentifierAvailable(v) => {
                    info.subscription_identifiers_available = v.value();
                }
                v5::Property::SharedSubscriptionAvailable(v) => {
                    info.shared_subscription_available = v.value();
                }
                v5::Property::ServerKeepAlive(v) => info.server_keep_alive = Some(v.value()),
                v5::Property::ResponseInformation(v) => {
                    info.response_information = Some(v.as_ref().to_owned());
                }
                v5::Property::ServerReference(v) => {
                    info.server_reference = Some(v.as_ref().to_owned());
                }
                v5::Property::ReasonString(v) => info.reason_string = Some(v.as_ref().to_owned()),
                v5::Property::UserProperty(pair) => {
                    info.user_properties
                        .push((pair.key().as_ref().to_owned(), pair.value().as_ref().to_owned()));
                }
                _ => {}
            }
        }
        info
    }

    async fn read_once(&mut self) -> Result<(), Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Lifecycle, "no active transport"))?;
        let mut chunk = Vec::with_capacity(self.config.input_buffer_size);
        let n = transport.read_buf(&mut chunk).await?;
        if n == 0 {
            return Err(Error::new(ErrorKind::Transport, "peer closed the connection"));
        }
        self.assembler.feed(&chunk);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let timeout = self.config.network_timeout;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Lifecycle, "no active transport"))?;
        time::timeout(timeout, transport.write_all(bytes))
            .await
            .map_err(|_err| Error::new(ErrorKind::Transport, "write timed out"))??;
        Ok(())
    }

    async fn step_connected(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        if self.disconnect_requested {
            self.disconnect_requested = false;
            let bytes = match self.config.protocol_level {
                ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::DisconnectPacket::new())?,
                ProtocolLevel::V5 => encode(&v5::DisconnectPacket::new())?,
            };
            let _ = self.write(&bytes).await;
            if self.config.clean_session {
                self.outbox.delete_all();
            }
            self.abort();
            self.status = ClientStatus::Disconnected;
            sink.on_event(Event::Disconnected);
            return Ok(());
        }

        if let Err(err) = self.drain_inbound(sink).await {
            sink.on_event(Event::Error(err.clone()));
            self.abort_with_disconnect(&err).await;
            sink.on_event(Event::Disconnected);
            return Ok(());
        }

        let now = self.now_ms();
        while let Some(id) = self
            .outbox
            .delete_single_expired(now, as_millis(OUTBOX_EXPIRED_TIMEOUT))
        {
            sink.on_event(Event::Deleted(id));
        }

        if let Err(err) = self.transmit_due_entries(now).await {
            sink.on_event(Event::Error(err.clone()));
            self.abort_with_disconnect(&err).await;
            sink.on_event(Event::Disconnected);
            return Ok(());
        }

        if let Err(err) = self.run_keepalive(now).await {
            sink.on_event(Event::Error(err.clone()));
            self.abort_with_disconnect(&err).await;
            sink.on_event(Event::Disconnected);
            return Ok(());
        }

        if let Some(refresh_after) = self.config.refresh_connection_after {
            if now.saturating_sub(self.refresh_connection_tick) >= as_millis(refresh_after) {
                self.abort();
                self.status = ClientStatus::Init;
                sink.on_event(Event::Disconnected);
            }
        }

        Ok(())
    }

    async fn transmit_due_entries(&mut self, now: u64) -> Result<(), Error> {
        if let Some(entry) = self.outbox.dequeue(OutboxState::Queued) {
            let id = entry.packet_id;
            let buffer = entry.buffer.clone();
            self.write(&buffer).await?;
            self.outbox.set_pending(id, OutboxState::Transmitted);
            self.outbox.set_tick(id, now);
            return Ok(());
        }

        let retransmit_timeout = as_millis(self.config.message_retransmit_timeout);
        if now.saturating_sub(self.last_retransmit_scan) < retransmit_timeout {
            return Ok(());
        }
        self.last_retransmit_scan = now;

        if let Some(entry) = self.outbox.dequeue(OutboxState::Transmitted) {
            if now.saturating_sub(entry.last_tick) < retransmit_timeout {
                return Ok(());
            }
            let id = entry.packet_id;
            let mut buffer = entry.buffer.clone();
            if let PacketType::Publish { qos, .. } = entry.packet_type {
                if qos != QoS::AtMostOnce {
                    if let Some(first) = buffer.first_mut() {
                        *first |= 0b0000_1000;
                    }
                }
            }
            self.write(&buffer).await?;
            self.outbox.set_tick(id, now);
        }
        Ok(())
    }

    async fn run_keepalive(&mut self, now: u64) -> Result<(), Error> {
        let keep_alive_ms = u64::from(self.config.wire_keep_alive()) * 1000;
        if keep_alive_ms == 0 {
            return Ok(());
        }

        if self.wait_for_ping_resp {
            if now.saturating_sub(self.keepalive_tick) >= keep_alive_ms {
                return Err(Error::new(ErrorKind::Transport, "keep-alive timeout: no PINGRESP"));
            }
            return Ok(());
        }

        if now.saturating_sub(self.keepalive_tick) >= keep_alive_ms / 2 {
            let bytes = match self.config.protocol_level {
                ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::PingRequestPacket::new())?,
                ProtocolLevel::V5 => encode(&v5::PingRequestPacket::new())?,
            };
            self.write(&bytes).await?;
            self.wait_for_ping_resp = true;
        }
        Ok(())
    }

    async fn drain_inbound(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        self.read_once().await?;
        loop {
            match self.assembler.poll(self.config.input_buffer_size)? {
                FrameOutcome::Pending => break,
                FrameOutcome::Oversized { header, total_len } => {
                    self.handle_oversized_publish(sink, header, total_len).await?;
                    break;
                }
                FrameOutcome::Complete { packet_type, bytes } => {
                    self.dispatch(sink, packet_type, &bytes)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        sink: &mut dyn EventSink,
        packet_type: PacketType,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let packet = VersionedPacket::decode(&mut ByteArray::new(bytes), self.config.protocol_level)?;
        match packet {
            VersionedPacket::V3(V3Packet::Publish(publish)) => self.handle_publish_v3(sink, &publish),
            VersionedPacket::V5(V5Packet::Publish(publish)) => self.handle_publish_v5(sink, &publish)?,
            VersionedPacket::V3(V3Packet::PublishAck(ack)) => self.handle_puback(sink, ack.packet_id()),
            VersionedPacket::V5(V5Packet::PublishAck(ack)) => self.handle_puback(sink, ack.packet_id()),
            VersionedPacket::V3(V3Packet::PublishReceived(ack)) => self.handle_pubrec(ack.packet_id()),
            VersionedPacket::V5(V5Packet::PublishReceived(ack)) => self.handle_pubrec(ack.packet_id()),
            VersionedPacket::V3(V3Packet::PublishRelease(ack)) => self.handle_pubrel(ack.packet_id()),
            VersionedPacket::V5(V5Packet::PublishRelease(ack)) => self.handle_pubrel(ack.packet_id()),
            VersionedPacket::V3(V3Packet::PublishComplete(ack)) => self.handle_pubcomp(sink, ack.packet_id()),
            VersionedPacket::V5(V5Packet::PublishComplete(ack)) => self.handle_pubcomp(sink, ack.packet_id()),
            VersionedPacket::V3(V3Packet::SubscribeAck(ack)) => {
                let granted = ack
                    .acknowledgements()
                    .iter()
                    .map(|a| match a {
                        v3::SubscribeAck::QoS(qos) => Ok(*qos),
                        v3::SubscribeAck::Failed => Err(0x80u8),
                    })
                    .collect();
                self.handle_suback(sink, ack.packet_id(), granted);
            }
            VersionedPacket::V5(V5Packet::SubscribeAck(ack)) => {
                let granted = ack
                    .reasons()
                    .iter()
                    .map(|r| QoS::try_from(*r as u8).map_or(Err(*r as u8), Ok))
                    .collect();
                self.handle_suback(sink, ack.packet_id(), granted);
            }
            VersionedPacket::V3(V3Packet::UnsubscribeAck(ack)) => self.handle_unsuback(sink, ack.packet_id()),
            VersionedPacket::V5(V5Packet::UnsubscribeAck(ack)) => self.handle_unsuback(sink, ack.packet_id()),
            VersionedPacket::V3(V3Packet::PingResponse(_)) | VersionedPacket::V5(V5Packet::PingResponse(_)) => {
                self.wait_for_ping_resp = false;
                self.keepalive_tick = self.now_ms();
            }
            _ => log::debug!("ignoring inbound packet of type {packet_type:?}"),
        }
        Ok(())
    }

    fn handle_publish_v3(&mut self, sink: &mut dyn EventSink, publish: &v3::PublishPacket) {
        let total_len = publish.message().len();
        sink.on_event(Event::Data(DataChunk {
            packet_id: (publish.qos() != QoS::AtMostOnce).then(|| publish.packet_id()),
            topic: Some(publish.topic().to_owned()),
            qos: publish.qos(),
            retain: publish.retain(),
            payload: publish.message().to_vec(),
            current_data_offset: total_len,
            total_data_len: total_len,
        }));
        self.ack_publish(publish.qos(), publish.packet_id());
    }

    fn handle_publish_v5(&mut self, sink: &mut dyn EventSink, publish: &v5::PublishPacket) -> Result<(), Error> {
        let mut topic = publish.topic().to_owned();
        for prop in publish.properties().props() {
            if let v5::Property::TopicAlias(alias) = prop {
                if topic.is_empty() {
                    match self.peer_topic_alias.resolve(alias.value()) {
                        Some(resolved) => topic = resolved.to_owned(),
                        None => {
                            return Err(Error::new(ErrorKind::Protocol, "unresolvable topic alias"));
                        }
                    }
                } else if self.peer_topic_alias.update(alias.value(), &topic).is_err() {
                    return Err(Error::new(ErrorKind::Protocol, "topic alias exceeds negotiated maximum"));
                }
            }
        }

        let total_len = publish.message().len();
        sink.on_event(Event::Data(DataChunk {
            packet_id: (publish.qos() != QoS::AtMostOnce).then(|| publish.packet_id()),
            topic: Some(topic),
            qos: publish.qos(),
            retain: publish.retain(),
            payload: publish.message().to_vec(),
            current_data_offset: total_len,
            total_data_len: total_len,
        }));
        self.ack_publish(publish.qos(), publish.packet_id());
        Ok(())
    }

    fn ack_publish(&mut self, qos: QoS, packet_id: PacketId) {
        let bytes = match (qos, self.config.protocol_level) {
            (QoS::AtMostOnce, _) => return,
            (QoS::AtLeastOnce, ProtocolLevel::V3 | ProtocolLevel::V4) => {
                encode(&v3::PublishAckPacket::new(packet_id))
            }
            (QoS::AtLeastOnce, ProtocolLevel::V5) => encode(&v5::PublishAckPacket::new(packet_id)),
            (QoS::ExactOnce, ProtocolLevel::V3 | ProtocolLevel::V4) => {
                encode(&v3::PublishReceivedPacket::new(packet_id))
            }
            (QoS::ExactOnce, ProtocolLevel::V5) => encode(&v5::PublishReceivedPacket::new(packet_id)),
        };
        if let Ok(bytes) = bytes {
            self.queue_immediate(bytes);
        }
    }

    /// Enqueue a packet the worker builds itself (acks, PUBREL/PUBCOMP).
    /// Riding the normal `Queued` lane is enough; a transient write failure
    /// surfaces on the next keep-alive/read cycle instead of blocking
    /// dispatch.
    fn queue_immediate(&mut self, bytes: Vec<u8>) {
        self.outbox.enqueue(
            bytes,
            PacketId::new(0),
            PacketType::PingResponse,
            QoS::AtMostOnce,
            self.now_ms(),
        );
    }

    async fn handle_oversized_publish(
        &mut self,
        sink: &mut dyn EventSink,
        header: Vec<u8>,
        total_len: usize,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(&header);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        let (qos, retain) = if let PacketType::Publish { qos, retain, .. } = fixed_header.packet_type() {
            (qos, retain)
        } else {
            return Err(Error::new(ErrorKind::Protocol, "oversized frame was not PUBLISH"));
        };
        let topic_len = usize::from(ba.read_u16()?);
        let topic = ba.read_string(topic_len)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(PacketId::new(ba.read_u16()?))
        };
        let header_consumed = ba.offset();
        let first_payload = header[header_consumed..].to_vec();
        let mut current_offset = first_payload.len();
        let total_data_len = total_len - header_consumed;

        sink.on_event(Event::Data(DataChunk {
            packet_id,
            topic: Some(topic),
            qos,
            retain,
            payload: first_payload,
            current_data_offset: current_offset,
            total_data_len,
        }));

        while current_offset < total_data_len {
            self.read_once().await?;
            let remaining = total_data_len - current_offset;
            let take = remaining.min(self.config.input_buffer_size);
            let chunk = self.assembler.take_raw(take);
            if chunk.is_empty() {
                continue;
            }
            current_offset += chunk.len();
            sink.on_event(Event::Data(DataChunk {
                packet_id,
                topic: None,
                qos,
                retain,
                payload: chunk,
                current_data_offset: current_offset,
                total_data_len,
            }));
        }

        if let Some(id) = packet_id {
            self.ack_publish(qos, id);
        }
        Ok(())
    }

    fn handle_puback(&mut self, sink: &mut dyn EventSink, packet_id: PacketId) {
        if let Some(entry) = self.outbox.get(packet_id) {
            let packet_type = entry.packet_type;
            self.outbox.delete(packet_id, packet_type);
        }
        self.flow_control.release();
        sink.on_event(Event::Published(PublishedInfo { packet_id }));
    }

    fn handle_pubrec(&mut self, packet_id: PacketId) {
        self.outbox.set_pending(packet_id, OutboxState::Acknowledged);
        if let Ok(bytes) = build_pubrel(self.config.protocol_level, packet_id) {
            self.queue_immediate(bytes);
        }
    }

    fn handle_pubrel(&mut self, packet_id: PacketId) {
        let bytes = match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::PublishCompletePacket::new(packet_id)),
            ProtocolLevel::V5 => encode(&v5::PublishCompletePacket::new(packet_id)),
        };
        if let Ok(bytes) = bytes {
            self.queue_immediate(bytes);
        }
    }

    fn handle_pubcomp(&mut self, sink: &mut dyn EventSink, packet_id: PacketId) {
        if let Some(entry) = self.outbox.get(packet_id) {
            let packet_type = entry.packet_type;
            self.outbox.delete(packet_id, packet_type);
        }
        self.flow_control.release();
        sink.on_event(Event::Published(PublishedInfo { packet_id }));
    }

    fn handle_suback(
        &mut self,
        sink: &mut dyn EventSink,
        packet_id: PacketId,
        granted: Vec<Result<QoS, u8>>,
    ) {
        self.outbox.delete(packet_id, PacketType::Subscribe);
        sink.on_event(Event::Subscribed(SubscribedInfo { packet_id, granted }));
    }

    fn handle_unsuback(&mut self, sink: &mut dyn EventSink, packet_id: PacketId) {
        self.outbox.delete(packet_id, PacketType::Unsubscribe);
        sink.on_event(Event::Unsubscribed(UnsubscribedInfo { packet_id }));
    }

    fn step_wait_reconnect(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        let _ = sink;
        let due = self.reconnect_requested
            || (self.config.auto_reconnect
                && self.now_ms().saturating_sub(self.reconnect_tick) >= as_millis(self.wait_timeout));
        if due {
            self.reconnect_requested = false;
            self.status = ClientStatus::Init;
        } else if !self.config.auto_reconnect {
            self.status = ClientStatus::Disconnected;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.transport = None;
        self.wait_timeout = self.config.reconnect_timeout;
        self.reconnect_tick = self.now_ms();
        self.wait_for_ping_resp = false;
        self.status = ClientStatus::WaitReconnect;
    }

    /// On a protocol violation (malformed packet, alias overflow, and the
    /// like) a v5 peer is owed a DISCONNECT carrying `PROTOCOL_ERROR` before
    /// the transport goes away; v3/v4 has no such mechanism and the socket
    /// just closes. Any other error kind (transport, I/O) skips straight to
    /// `abort` since there's nothing meaningful left to write to.
    async fn abort_with_disconnect(&mut self, err: &Error) {
        if matches!(err.kind(), ErrorKind::Protocol) && self.config.protocol_level == ProtocolLevel::V5 {
            let mut packet = v5::DisconnectPacket::new();
            packet.set_reason_code(v5::ReasonCode::ProtocolError);
            if let Ok(bytes) = encode(&packet) {
                let _ = self.write(&bytes).await;
            }
        }
        self.abort();
    }

    /// Enqueue a PUBLISH for transmission on the next worker iteration.
    ///
    /// # Errors
    ///
    /// Returns a `Lifecycle` error if disconnected and skip-if-disconnected
    /// is set, a `Config` error on an unsupported qos/retain combination,
    /// or a `Resource` error if v5 flow control is exhausted.
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<PacketId, Error> {
        if self.status != ClientStatus::Connected && self.config.skip_publish_if_disconnected {
            return Err(Error::new(ErrorKind::Lifecycle, "publish while disconnected"));
        }
        if let Some(info) = &self.connected_info {
            if qos > info.maximum_qos {
                return Err(Error::new(ErrorKind::Config, "qos exceeds server maximum"));
            }
            if retain && !info.retain_available {
                return Err(Error::new(ErrorKind::Config, "retain not available on this server"));
            }
        }
        if qos != QoS::AtMostOnce && self.config.protocol_level == ProtocolLevel::V5 {
            self.flow_control.reserve()?;
        }

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            self.packet_ids.next(|v| self.outbox.get(PacketId::new(v)).is_some())
        };

        let bytes = match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => {
                let mut packet = v3::PublishPacket::new(topic, qos, payload)?;
                packet.set_retain(retain);
                if qos != QoS::AtMostOnce {
                    packet.set_packet_id(packet_id);
                }
                encode(&packet)?
            }
            ProtocolLevel::V5 => {
                // Once this client has assigned `topic` an alias and told
                // the peer about it, later publishes to the same topic can
                // go out with an empty topic string plus just the alias.
                let mut packet = match self.own_topic_alias.alias_for(topic) {
                    Some((alias, is_new)) => {
                        let wire_topic = if is_new { topic } else { "" };
                        let mut packet = v5::PublishPacket::new(wire_topic, qos, payload)?;
                        packet
                            .properties_mut()
                            .push(v5::Property::TopicAlias(U16Data::new(alias)))?;
                        packet
                    }
                    None => v5::PublishPacket::new(topic, qos, payload)?,
                };
                packet.set_retain(retain);
                if qos != QoS::AtMostOnce {
                    packet.set_packet_id(packet_id);
                }
                encode(&packet)?
            }
        };

        let max_packet_size = self
            .connected_info
            .as_ref()
            .map(|info| info.maximum_packet_size)
            .filter(|&max| max != 0);
        if let Some(max) = max_packet_size {
            if bytes.len() > usize::try_from(max).unwrap_or(usize::MAX) {
                return Err(Error::new(
                    ErrorKind::Config,
                    "encoded packet exceeds the server's maximum packet size",
                ));
            }
        }

        let packet_type = PacketType::Publish { dup: false, qos, retain };
        self.outbox.enqueue(bytes, packet_id, packet_type, qos, self.now_ms());
        Ok(packet_id)
    }

    /// Enqueue a SUBSCRIBE for `topic`.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is malformed.
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<PacketId, Error> {
        let packet_id = self.packet_ids.next(|v| self.outbox.get(PacketId::new(v)).is_some());
        let bytes = match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::SubscribePacket::new(topic, qos, packet_id)?)?,
            ProtocolLevel::V5 => encode(&v5::SubscribePacket::new(topic, qos, packet_id)?)?,
        };
        self.outbox
            .enqueue(bytes, packet_id, PacketType::Subscribe, QoS::AtLeastOnce, self.now_ms());
        Ok(packet_id)
    }

    /// Enqueue an UNSUBSCRIBE for `topic`.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is malformed.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<PacketId, Error> {
        let packet_id = self.packet_ids.next(|v| self.outbox.get(PacketId::new(v)).is_some());
        let bytes = match self.config.protocol_level {
            ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::UnsubscribePacket::new(topic, packet_id)?)?,
            ProtocolLevel::V5 => encode(&v5::UnsubscribePacket::new(topic, packet_id)?)?,
        };
        self.outbox
            .enqueue(bytes, packet_id, PacketType::Unsubscribe, QoS::AtLeastOnce, self.now_ms());
        Ok(packet_id)
    }
}

fn build_pubrel(level: ProtocolLevel, packet_id: PacketId) -> Result<Vec<u8>, Error> {
    match level {
        ProtocolLevel::V3 | ProtocolLevel::V4 => encode(&v3::PublishReleasePacket::new(packet_id)),
        ProtocolLevel::V5 => encode(&v5::PublishReleasePacket::new(packet_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Will;
    use crate::event::FnSink;

    fn session_with(f: impl FnOnce(&mut ClientConfig)) -> Session {
        let mut config = ClientConfig::new("mqtt://127.0.0.1:1883").unwrap();
        f(&mut config);
        Session::new(config)
    }

    #[test]
    fn test_publish_rejected_while_disconnected_if_configured() {
        let mut session = session_with(|c| c.skip_publish_if_disconnected = true);
        let err = session.publish("a/b", b"hi", QoS::AtMostOnce, false).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Lifecycle));
    }

    #[test]
    fn test_publish_qos0_does_not_consume_a_packet_id() {
        let mut session = session_with(|_| {});
        let id = session.publish("a/b", b"hi", QoS::AtMostOnce, false).unwrap();
        assert_eq!(id, PacketId::new(0));
    }

    #[test]
    fn test_publish_qos1_assigns_distinct_packet_ids() {
        let mut session = session_with(|_| {});
        let first = session.publish("a/b", b"one", QoS::AtLeastOnce, false).unwrap();
        let second = session.publish("a/b", b"two", QoS::AtLeastOnce, false).unwrap();
        assert_ne!(first, second);
        assert!(session.outbox.get(first).is_some());
        assert!(session.outbox.get(second).is_some());
    }

    #[test]
    fn test_subscribe_and_unsubscribe_use_distinct_packet_ids() {
        let mut session = session_with(|_| {});
        let sub_id = session.subscribe("a/b", QoS::AtLeastOnce).unwrap();
        let unsub_id = session.unsubscribe("a/b").unwrap();
        assert_ne!(sub_id, unsub_id);
        assert_eq!(session.outbox.get(sub_id).unwrap().packet_type, PacketType::Subscribe);
        assert_eq!(
            session.outbox.get(unsub_id).unwrap().packet_type,
            PacketType::Unsubscribe
        );
    }

    #[test]
    fn test_handle_suback_removes_outbox_entry_and_emits_event() {
        let mut session = session_with(|_| {});
        let packet_id = session.subscribe("a/b", QoS::AtLeastOnce).unwrap();
        let mut seen = Vec::new();
        let mut sink = FnSink(|event: Event| seen.push(format!("{event:?}")));
        session.handle_suback(&mut sink, packet_id, vec![Ok(QoS::AtLeastOnce)]);
        assert!(session.outbox.get(packet_id).is_none());
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_ack_publish_qos0_does_not_enqueue_anything() {
        let mut session = session_with(|_| {});
        session.ack_publish(QoS::AtMostOnce, PacketId::new(1));
        assert!(session.outbox.get(PacketId::new(0)).is_none());
    }

    #[test]
    fn test_ack_publish_qos1_queues_a_puback() {
        let mut session = session_with(|_| {});
        session.ack_publish(QoS::AtLeastOnce, PacketId::new(7));
        assert!(session.outbox.dequeue(OutboxState::Queued).is_some());
    }

    #[test]
    fn test_build_connect_v3_round_trips_will_and_credentials() {
        let mut session = session_with(|c| {
            c.protocol_level = ProtocolLevel::V4;
            c.set_client_id("abc");
            c.set_username("user");
            c.set_password("pass");
            c.set_will(Will {
                topic: "will/topic".to_owned(),
                payload: b"bye".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
                ..Will::default()
            });
        });
        let bytes = session.build_connect().unwrap();
        let mut ba = ByteArray::new(&bytes);
        let packet = v3::ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.client_id(), "abc");
        assert!(packet.connect_flags().will());
        assert!(packet.connect_flags().will_retain());
        assert!(packet.connect_flags().has_username());
        assert!(packet.connect_flags().has_password());
    }

    #[test]
    fn test_build_connect_v5_sets_username() {
        let mut session = session_with(|c| {
            c.protocol_level = ProtocolLevel::V5;
            c.set_client_id("abc");
            c.set_username("user");
        });
        let bytes = session.build_connect().unwrap();
        let mut ba = ByteArray::new(&bytes);
        let packet = v5::ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.client_id(), "abc");
    }

    #[test]
    fn test_step_wait_reconnect_moves_to_init_when_due() {
        let mut session = session_with(|c| {
            c.reconnect_timeout = Duration::from_millis(0);
            c.auto_reconnect = true;
        });
        session.status = ClientStatus::WaitReconnect;
        let mut sink = FnSink(|_event: Event| {});
        session.step_wait_reconnect(&mut sink).unwrap();
        assert_eq!(session.status(), ClientStatus::Init);
    }

    #[test]
    fn test_step_wait_reconnect_goes_to_disconnected_without_auto_reconnect() {
        let mut session = session_with(|c| c.auto_reconnect = false);
        session.status = ClientStatus::WaitReconnect;
        let mut sink = FnSink(|_event: Event| {});
        session.step_wait_reconnect(&mut sink).unwrap();
        assert_eq!(session.status(), ClientStatus::Disconnected);
    }

    #[test]
    fn test_publish_rejects_packet_over_server_maximum_size() {
        let mut session = session_with(|c| c.protocol_level = ProtocolLevel::V5);
        session.connected_info = Some(ConnectedInfo {
            maximum_packet_size: 8,
            ..ConnectedInfo::default()
        });
        let err = session
            .publish("a/b", b"a payload far longer than eight bytes", QoS::AtMostOnce, false)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config));
        assert!(session.outbox.dequeue(OutboxState::Queued).is_none());
    }

    #[test]
    fn test_publish_maximum_size_zero_means_unbounded() {
        let mut session = session_with(|c| c.protocol_level = ProtocolLevel::V5);
        session.connected_info = Some(ConnectedInfo {
            maximum_packet_size: 0,
            ..ConnectedInfo::default()
        });
        assert!(session.publish("a/b", b"hi", QoS::AtMostOnce, false).is_ok());
    }

    #[test]
    fn test_publish_v5_reuses_topic_alias_on_repeat_publish() {
        let mut session = session_with(|c| c.protocol_level = ProtocolLevel::V5);
        session.own_topic_alias = TopicAliasTable::new(10);

        let first_id = session.publish("a/b", b"one", QoS::AtLeastOnce, false).unwrap();
        let first = session.outbox.get(first_id).unwrap();
        let mut ba = ByteArray::new(&first.buffer);
        let packet = v5::PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.topic(), "a/b");
        assert!(packet
            .properties()
            .props()
            .iter()
            .any(|p| matches!(p, v5::Property::TopicAlias(_))));

        let second_id = session.publish("a/b", b"two", QoS::AtLeastOnce, false).unwrap();
        let second = session.outbox.get(second_id).unwrap();
        let mut ba = ByteArray::new(&second.buffer);
        let packet = v5::PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.topic(), "");
        assert!(packet
            .properties()
            .props()
            .iter()
            .any(|p| matches!(p, v5::Property::TopicAlias(_))));
    }

    #[test]
    fn test_handle_publish_v5_rejects_unresolvable_alias_as_protocol_error() {
        let mut session = session_with(|c| c.protocol_level = ProtocolLevel::V5);
        let mut publish = v5::PublishPacket::new("", QoS::AtMostOnce, b"hi").unwrap();
        publish
            .properties_mut()
            .push(v5::Property::TopicAlias(U16Data::new(1)))
            .unwrap();
        let mut sink = FnSink(|_event: Event| {});
        let err = session.handle_publish_v5(&mut sink, &publish).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn test_disconnect_requested_clears_outbox_on_clean_session() {
        let mut session = session_with(|c| c.clean_session = true);
        session.publish("a/b", b"hi", QoS::AtLeastOnce, false).unwrap();
        session.publish("a/b", b"hi again", QoS::AtLeastOnce, false).unwrap();
        session.request_disconnect();
        let mut sink = FnSink(|_event: Event| {});
        session.step_connected(&mut sink).await.unwrap();
        assert!(session.outbox.dequeue(OutboxState::Queued).is_none());
    }
}
