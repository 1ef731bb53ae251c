// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::rustls::{self, Certificate, OwnedTrustAnchor, PrivateKey, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::config::{ClientConfig, Scheme, TlsConfig};
use crate::error::{Error, ErrorKind};

/// One established byte-stream connection to the broker, in whichever of
/// the four recognized schemes it was opened under.
pub enum Transport {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(WebSocketStream<TcpStream>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

fn build_rustls_config(tls: &TlsConfig) -> Result<rustls::ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_cert) = &tls.ca_cert {
        let mut reader = io::BufReader::new(ca_cert.as_slice());
        for cert in rustls_pemfile::certs(&mut reader)
            .map_err(|err| Error::from_string(ErrorKind::Tls, format!("invalid CA cert: {err}")))?
        {
            roots
                .add(&Certificate(cert))
                .map_err(|err| Error::from_string(ErrorKind::Tls, format!("bad CA cert: {err}")))?;
        }
    }
    if !tls.use_global_ca_store || tls.ca_cert.is_none() {
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
    }

    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_pem), Some(key_pem)) => {
            let mut cert_reader = io::BufReader::new(cert_pem.as_slice());
            let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
                .map_err(|err| {
                    Error::from_string(ErrorKind::Tls, format!("invalid client cert: {err}"))
                })?
                .into_iter()
                .map(Certificate)
                .collect();
            let mut key_reader = io::BufReader::new(key_pem.as_slice());
            let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
                .map_err(|err| {
                    Error::from_string(ErrorKind::Tls, format!("invalid client key: {err}"))
                })?
                .into_iter()
                .next()
                .map(PrivateKey)
                .ok_or_else(|| Error::new(ErrorKind::Tls, "no private key found in client key"))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|err| Error::from_string(ErrorKind::Tls, format!("{err}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(config)
}

impl Transport {
    /// Resolve `config`'s uri, connect with `config.network_timeout`, and
    /// return a transport ready for framed read/write.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error on DNS/connect/handshake failure, or a
    /// `Tls` error building the rustls config.
    pub async fn connect(config: &ClientConfig) -> Result<Self, Error> {
        let address = format!("{}:{}", config.uri.host, config.uri.port);
        let timeout = config.network_timeout;

        match config.uri.scheme {
            Scheme::Mqtt => Self::connect_mqtt(&address, timeout).await,
            Scheme::Mqtts => Self::connect_mqtts(&address, &config.uri.host, &config.tls, timeout).await,
            Scheme::Ws => Self::connect_ws(&address, &config.uri.path, timeout).await,
            Scheme::Wss => {
                Self::connect_wss(&address, &config.uri.host, &config.uri.path, &config.tls, timeout)
                    .await
            }
        }
    }

    async fn connect_mqtt(address: &str, timeout: Duration) -> Result<Self, Error> {
        let socket = dial(address, timeout).await?;
        Ok(Self::Mqtt(socket))
    }

    async fn connect_mqtts(
        address: &str,
        domain: &str,
        tls: &TlsConfig,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let socket = dial(address, timeout).await?;
        let rustls_config = build_rustls_config(tls)?;
        let connector = TlsConnector::from(Arc::new(rustls_config));
        let server_name = rustls::ServerName::try_from(domain)
            .map_err(|_err| Error::new(ErrorKind::Config, "invalid TLS server name"))?;
        let tls_socket = time::timeout(timeout, connector.connect(server_name, socket))
            .await
            .map_err(|_err| Error::new(ErrorKind::Transport, "TLS handshake timed out"))?
            .map_err(|err| Error::from_string(ErrorKind::Tls, format!("{err}")))?;
        Ok(Self::Mqtts(Box::new(tls_socket)))
    }

    async fn connect_ws(address: &str, path: &str, timeout: Duration) -> Result<Self, Error> {
        let socket = dial(address, timeout).await?;
        let url = format!("ws://{address}{path}");
        let (ws, _response) = time::timeout(timeout, tokio_tungstenite::client_async(url, socket))
            .await
            .map_err(|_err| Error::new(ErrorKind::Transport, "websocket handshake timed out"))?
            .map_err(Error::from)?;
        Ok(Self::Ws(ws))
    }

    async fn connect_wss(
        address: &str,
        domain: &str,
        path: &str,
        tls: &TlsConfig,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let socket = dial(address, timeout).await?;
        let rustls_config = build_rustls_config(tls)?;
        let connector = TlsConnector::from(Arc::new(rustls_config));
        let server_name = rustls::ServerName::try_from(domain)
            .map_err(|_err| Error::new(ErrorKind::Config, "invalid TLS server name"))?;
        let tls_socket = time::timeout(timeout, connector.connect(server_name, socket))
            .await
            .map_err(|_err| Error::new(ErrorKind::Transport, "TLS handshake timed out"))?
            .map_err(|err| Error::from_string(ErrorKind::Tls, format!("{err}")))?;
        let url = format!("wss://{address}{path}");
        let (ws, _response) =
            time::timeout(timeout, tokio_tungstenite::client_async(url, tls_socket))
                .await
                .map_err(|_err| Error::new(ErrorKind::Transport, "websocket handshake timed out"))?
                .map_err(Error::from)?;
        Ok(Self::Wss(Box::new(ws)))
    }

    /// Read whatever bytes are currently available, appending them to
    /// `buf`. Returns the number of bytes read; `0` means the peer closed
    /// the connection (for `Ws`/`Wss`, a close frame).
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error on the underlying I/O or WebSocket
    /// failure.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(socket) => socket.read_buf(buf).await.map_err(Error::from),
            Self::Mqtts(socket) => socket.read_buf(buf).await.map_err(Error::from),
            Self::Ws(ws) => read_ws_frame(ws, buf).await,
            Self::Wss(ws) => read_ws_frame(ws, buf).await,
        }
    }

    /// Write the whole buffer, honoring no internal timeout (the caller
    /// wraps this in `tokio::time::timeout`).
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error on the underlying I/O or WebSocket
    /// failure.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(socket) => socket.write_all(buf).await.map_err(Error::from),
            Self::Mqtts(socket) => socket.write_all(buf).await.map_err(Error::from),
            Self::Ws(ws) => ws.send(Message::binary(buf)).await.map_err(Error::from),
            Self::Wss(ws) => ws.send(Message::binary(buf)).await.map_err(Error::from),
        }
    }
}

async fn dial(address: &str, timeout: Duration) -> Result<TcpStream, Error> {
    time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_err| Error::new(ErrorKind::Transport, "connect timed out"))?
        .map_err(Error::from)
}

async fn read_ws_frame<S>(ws: &mut WebSocketStream<S>, buf: &mut Vec<u8>) -> Result<usize, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match ws.next().await {
        Some(Ok(message)) => {
            let data = message.into_data();
            let len = data.len();
            buf.extend(data);
            Ok(len)
        }
        Some(Err(err)) => Err(Error::from(err)),
        None => Ok(0),
    }
}

/// Resolve a literal host/port to a `SocketAddr` without a full DNS
/// lookup, for transports that are handed a pre-resolved address.
#[must_use]
pub fn parse_socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    format!("{host}:{port}").parse().ok()
}
