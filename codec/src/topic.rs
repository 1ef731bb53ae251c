// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, StringData};

/// A topic name used in PUBLISH. Must not contain the wildcard characters
/// `+` or `#`, and must not be empty unless a v5 topic alias resolves it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PubTopic(StringData);

impl PubTopic {
    /// # Errors
    ///
    /// Returns error if `topic` contains a wildcard character or is too long.
    pub fn new(topic: &str) -> Result<Self, EncodeError> {
        if topic.contains('+') || topic.contains('#') {
            return Err(EncodeError::InvalidPacketType);
        }
        let data = StringData::from(topic).map_err(|_err| EncodeError::TooManyData)?;
        Ok(Self(data))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.0.bytes()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let data = StringData::decode(ba)?;
        Ok(Self(data))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.0.encode(buf)
    }
}

/// A topic filter used in SUBSCRIBE/UNSUBSCRIBE. May contain `+`
/// (single-level wildcard) and `#` (multi-level wildcard, only as the last
/// segment), and may be wrapped as a shared subscription
/// `$share/{group}/{filter}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTopic {
    /// Wire form, exactly as sent/received (including any `$share/` wrapper).
    raw: StringData,

    /// Shared-subscription group name, if this filter is wrapped.
    share_group: Option<String>,

    /// Segments of the filter with the `$share/{group}/` wrapper stripped.
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Name(String),
    /// `+`
    Plus,
    /// `#`, only legal as the final segment
    Hash,
}

impl SubTopic {
    /// # Errors
    ///
    /// Returns error if the filter is empty, `#` appears anywhere but last,
    /// or a segment mixes a wildcard with other characters.
    pub fn new(filter: &str) -> Result<Self, EncodeError> {
        if filter.is_empty() {
            return Err(EncodeError::TooManyData);
        }

        let (share_group, unwrapped) = split_share(filter);

        let parts: Vec<&str> = unwrapped.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            let segment = match *part {
                "+" => Segment::Plus,
                "#" => {
                    if !is_last {
                        return Err(EncodeError::InvalidPacketType);
                    }
                    Segment::Hash
                }
                s if s.contains('+') || s.contains('#') => {
                    return Err(EncodeError::InvalidPacketType);
                }
                s => Segment::Name(s.to_string()),
            };
            segments.push(segment);
        }

        let raw = StringData::from(filter).map_err(|_err| EncodeError::TooManyData)?;
        Ok(Self {
            raw,
            share_group,
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.raw.as_ref()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.raw.bytes()
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.share_group.is_some()
    }

    #[must_use]
    pub fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    /// Returns true if `topic` (a concrete publish topic, never containing
    /// wildcards) matches this filter.
    ///
    /// A filter whose first segment is a wildcard never matches a topic
    /// whose first segment starts with `$` (e.g. `$SYS/...`).
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let topic_parts: Vec<&str> = topic.split('/').collect();
        if let Some(first) = topic_parts.first() {
            if first.starts_with('$') {
                if let Some(Segment::Name(name)) = self.segments.first() {
                    if name != first {
                        return false;
                    }
                } else {
                    return false;
                }
            }
        }
        match_segments(&self.segments, &topic_parts)
    }
}

fn match_segments(filter: &[Segment], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(Segment::Hash), Some(_)) => true,
        (Some(Segment::Plus), Some(_)) => match_segments(&filter[1..], &topic[1..]),
        (Some(Segment::Name(name)), Some(part)) => {
            name == part && match_segments(&filter[1..], &topic[1..])
        }
    }
}

/// Splits a possibly-shared filter `$share/{group}/{filter}` into the
/// group name (if present) and the remaining filter string.
fn split_share(filter: &str) -> (Option<String>, &str) {
    if let Some(rest) = filter.strip_prefix("$share/") {
        if let Some(slash) = rest.find('/') {
            let (group, remainder) = rest.split_at(slash);
            return (Some(group.to_string()), &remainder[1..]);
        }
    }
    (None, filter)
}

/// Wraps `filter` as a shared-subscription filter for the wire, per
/// `$share/{group}/{filter}`.
#[must_use]
pub fn wrap_shared(group: &str, filter: &str) -> String {
    format!("$share/{group}/{filter}")
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let data = StringData::decode(ba)?;
        Self::new(data.as_ref()).map_err(|_err| DecodeError::OtherErrors)
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.raw.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_wildcard() {
        let filter = SubTopic::new("sport/+/player1").unwrap();
        assert!(filter.matches("sport/tennis/player1"));
        assert!(!filter.matches("sport/tennis/player1/ranking"));
    }

    #[test]
    fn test_hash_wildcard() {
        let filter = SubTopic::new("sport/#").unwrap();
        assert!(filter.matches("sport"));
        assert!(filter.matches("sport/tennis/player1"));
    }

    #[test]
    fn test_hash_must_be_last() {
        assert!(SubTopic::new("sport/#/extra").is_err());
    }

    #[test]
    fn test_dollar_topic_not_matched_by_wildcard() {
        let filter = SubTopic::new("+/monitor/Clients").unwrap();
        assert!(!filter.matches("$SYS/monitor/Clients"));
        let filter = SubTopic::new("$SYS/monitor/Clients").unwrap();
        assert!(filter.matches("$SYS/monitor/Clients"));
    }

    #[test]
    fn test_shared_subscription_wrap() {
        let wrapped = wrap_shared("group1", "sport/tennis");
        assert_eq!(wrapped, "$share/group1/sport/tennis");
        let filter = SubTopic::new(&wrapped).unwrap();
        assert!(filter.is_shared());
        assert_eq!(filter.share_group(), Some("group1"));
        assert!(filter.matches("sport/tennis"));
    }

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("a/+/b").is_err());
        assert!(PubTopic::new("a/#").is_err());
        assert!(PubTopic::new("a/b").is_ok());
    }
}
