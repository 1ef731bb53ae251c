// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::fmt;

/// Generate a random alphanumeric string of `len` characters.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// String is longer than 65535 bytes once encoded as UTF-8.
    TooLong,

    /// Bytes are not well-formed UTF-8.
    InvalidUtf8,

    /// String contains the null character U+0000, which MQTT-1.5.4-2 forbids.
    ContainsNull,
}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for StringError {}

/// Decode `bytes` as a UTF-8 MQTT string, rejecting the null character.
///
/// # Errors
///
/// Returns error if `bytes` is not valid UTF-8 or contains U+0000.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_err| StringError::InvalidUtf8)?;
    validate_utf8_string(s)?;
    Ok(s.to_string())
}

/// Validate that `s` is a legal MQTT UTF-8 Encoded String: no null
/// character, and no more than 65535 bytes once encoded.
///
/// # Errors
///
/// Returns error if `s` is too long or contains U+0000.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooLong);
    }
    if s.contains('\u{0000}') {
        return Err(StringError::ContainsNull);
    }
    Ok(())
}

/// Validate that `data` fits the two-byte length prefix used by Binary Data.
///
/// # Errors
///
/// Returns error if `data` is longer than 65535 bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), crate::EncodeError> {
    if data.len() > usize::from(u16::MAX) {
        Err(crate::EncodeError::TooManyData)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// No chars, and clean-session is not set (MQTT-3.1.3-8).
    Empty,

    /// Contains a character other than UTF-8 or the null character.
    InvalidChars,
}

impl fmt::Display for ClientIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ClientIdError {}

/// Validate a caller-supplied client id.
///
/// A zero-length client id is valid on the wire (the server assigns one);
/// callers that want a *default* id populated locally should use
/// [`default_client_id`] instead of passing an empty string.
///
/// # Errors
///
/// Returns error if `client_id` contains the null character.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.contains('\u{0000}') {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Generate a default client id when the caller configured none and did not
/// request the "null client id" behavior.
///
/// Device firmware typically derives this from the network MAC address. A
/// portable library has no uniform way to read hardware MAC addresses
/// without an OS-specific dependency, so this generates a locally-unique
/// 6-byte identifier in the same `xx:xx:xx:xx:xx:xx` shape and formats it
/// the same way: a `"mqtt_"` prefix followed by the hex digits with
/// separators removed.
#[must_use]
pub fn default_client_id() -> String {
    let mut rng = thread_rng();
    let octets: [u8; 6] = rng.gen();
    let hex: String = octets.iter().map(|b| format!("{b:02x}")).collect();
    format!("mqtt_{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string_rejects_null() {
        assert!(validate_utf8_string("a\u{0000}b").is_err());
        assert!(validate_utf8_string("ok").is_ok());
    }

    #[test]
    fn test_default_client_id_shape() {
        let id = default_client_id();
        assert!(id.starts_with("mqtt_"));
        assert_eq!(id.len(), "mqtt_".len() + 12);
    }
}
