// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use tokio_tungstenite::tungstenite;

/// Represent the types of errors a client-facing call can fail with.
#[derive(Clone, Debug)]
pub enum ErrorKind {
    /// Conflicting configuration: scheme mismatch between URI and explicit
    /// transport, TLS fields set against a non-TLS scheme, out-of-range
    /// numeric field, or a QoS/retain request the broker has not advertised
    /// support for.
    Config,

    /// Connect/read/write failure at the transport layer (socket, TLS, or
    /// WebSocket). Reported asynchronously as an `Error` event; the session
    /// then moves to `WAIT_RECONNECT`.
    Transport,

    /// CONNACK (or AUTH) carried a reason code other than success.
    ConnectionRefused,

    /// Malformed packet, forbidden flag combination, forbidden repeated
    /// property, or other wire-level violation. The client disconnects with
    /// `PROTOCOL_ERROR` (v5) or aborts (v3) on this error.
    Protocol,

    /// Allocation failure or out-of-buffer condition while encoding.
    Resource,

    /// Misuse of the API surface itself: `stop()` called from inside the
    /// event callback, `start()` called twice, or `publish()` while
    /// disconnected with skip-if-disconnected enabled.
    Lifecycle,

    /// Lower-level I/O failure, wrapped rather than classified.
    Io,

    /// TLS handshake or certificate failure.
    Tls,

    /// WebSocket framing/handshake failure.
    WebSocket,

    /// Wraps a codec-level encode failure.
    Encode,

    /// Wraps a codec-level decode failure.
    Decode,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::Io, format!("IoError {err}"))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::from_string(ErrorKind::WebSocket, format!("Websocket error: {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::Encode, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::Decode, format!("{err:?}"))
    }
}

impl From<codec::ByteArrayError> for Error {
    fn from(err: codec::ByteArrayError) -> Self {
        Self::from_string(ErrorKind::Decode, format!("{err:?}"))
    }
}
