// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{PacketId, QoS};

use crate::error::Error;

/// Fields published in a `Connected` event. v5-only fields fall back to
/// their protocol defaults when the corresponding CONNACK property is
/// absent.
#[derive(Debug, Clone, Default)]
pub struct ConnectedInfo {
    pub session_present: bool,
    pub server_keep_alive: Option<u16>,
    pub receive_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub maximum_packet_size: u32,
    pub assigned_client_id: Option<String>,
    pub topic_alias_maximum: u16,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscription_available: bool,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

/// One chunk of an inbound PUBLISH. Oversized messages are delivered as a
/// sequence of `Data` events; only the first carries `topic`.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub packet_id: Option<PacketId>,
    pub topic: Option<String>,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub current_data_offset: usize,
    pub total_data_len: usize,
}

/// Reason codes/granted qos reported back for a (un)subscribe ack.
#[derive(Debug, Clone)]
pub struct SubscribedInfo {
    pub packet_id: PacketId,
    pub granted: Vec<Result<QoS, u8>>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribedInfo {
    pub packet_id: PacketId,
}

#[derive(Debug, Clone)]
pub struct PublishedInfo {
    pub packet_id: PacketId,
}

/// Every event kind the core emits.
#[derive(Debug, Clone)]
pub enum Event {
    BeforeConnect,
    Connected(ConnectedInfo),
    Disconnected,
    Subscribed(SubscribedInfo),
    Unsubscribed(UnsubscribedInfo),
    Published(PublishedInfo),
    Data(DataChunk),
    Error(Error),
    Deleted(PacketId),
}

/// Consumer of emitted events. A direct callback is the simplest
/// implementation; an async fanout channel can be layered over it.
pub trait EventSink: Send {
    fn on_event(&mut self, event: Event);
}

/// `EventSink` over a plain closure, for callers that don't need state.
pub struct FnSink<F>(pub F)
where
    F: FnMut(Event) + Send;

impl<F> EventSink for FnSink<F>
where
    F: FnMut(Event) + Send,
{
    fn on_event(&mut self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_sink_forwards_events() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|event: Event| {
                if let Event::Disconnected = event {
                    seen.push(());
                }
            });
            sink.on_event(Event::Disconnected);
        }
        assert_eq!(seen.len(), 1);
    }
}
