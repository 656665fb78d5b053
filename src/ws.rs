//! WebSocket dialing.
//!
//! A single [`connect`] function handles URL→request building, header
//! insertion, and TLS negotiation, returning a raw stream that
//! [`Transport::from_stream`] takes ownership of. The [`Connector`] trait is
//! the seam the listener dials through, so tests can hand it in-memory
//! streams instead of real sockets.

use async_trait::async_trait;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::transport::{Transport, TransportError, TransportEvents};

/// Concrete stream type returned by [`connect`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens one physical connection.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Dial `url` with extra handshake `headers` and wrap the result in a [`Transport`].
    async fn dial(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(Transport, TransportEvents), TransportError>;
}

/// Default [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn dial(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(Transport, TransportEvents), TransportError> {
        let stream = connect(url, headers).await?;
        Ok(Transport::from_stream(stream))
    }
}

/// Connect to a WebSocket URL with extra headers.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<WsStream, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|source| TransportError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::InvalidHeader {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|err| TransportError::InvalidHeader {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|source| TransportError::Dial {
            url: redact_query(url),
            source,
        })?;
    log::debug!("[Ws] Handshake complete: HTTP {}", response.status());
    Ok(stream)
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

/// Strip the signed query string before a URL reaches logs or errors.
pub(crate) fn redact_query(url: &str) -> String {
    url.split_once('?')
        .map_or_else(|| url.to_string(), |(base, _)| format!("{base}?…"))
}
