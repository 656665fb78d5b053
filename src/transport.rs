//! One physical WebSocket connection.
//!
//! A [`Transport`] owns exactly one connection and turns it into three
//! asynchronous outputs and one input, all free of protocol semantics:
//!
//! ```text
//!                   ┌──────────── read task ────────────┐
//!   socket ────────►│ Binary/Text ──► messages (mpsc)    │
//!                   │ Close / error ─► closed (oneshot)  │
//!                   └────────────────────────────────────┘
//!                   ┌──────────── write task ───────────┐
//!   write() ──queue►│ send ── fatal ──► closed           │──► socket
//!                   │      └─ other ──► errors (mpsc)    │
//!                   └────────────────────────────────────┘
//! ```
//!
//! Closure is reported exactly once, by whichever cause fires first: a peer
//! close frame, a read fault, a fatal write fault, or a local [`Transport::close`].

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CLOSE_ABNORMAL, CLOSE_FLUSH_TIMEOUT, CLOSE_NO_STATUS, INBOUND_QUEUE_CAPACITY,
    OUTBOUND_QUEUE_CAPACITY,
};

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code (peer-supplied, local, or [`CLOSE_ABNORMAL`]).
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseInfo {
    /// Create a close record.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// Transport-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// URL could not be turned into a handshake request.
    #[error("invalid websocket url {url}: {source}")]
    InvalidUrl {
        /// The URL given.
        url: String,
        /// Underlying error.
        #[source]
        source: tungstenite::Error,
    },
    /// A handshake header name or value is malformed.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Parser message.
        reason: String,
    },
    /// TCP, TLS, or WebSocket handshake failed.
    #[error("dial {url} failed: {source}")]
    Dial {
        /// URL dialed, query redacted.
        url: String,
        /// Underlying error.
        #[source]
        source: tungstenite::Error,
    },
    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection has already closed.
    #[error("transport closed")]
    Closed,
    /// A text frame was requested for non-UTF-8 bytes.
    #[error("text frame is not valid UTF-8")]
    InvalidText(#[source] std::string::FromUtf8Error),
    /// A non-fatal write failure.
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),
}

/// WebSocket frame type for [`Transport::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Binary frame.
    Binary,
    /// UTF-8 text frame.
    Text,
}

/// Receiving side of a [`Transport`].
#[derive(Debug)]
pub struct TransportEvents {
    /// Inbound frame payloads, in arrival order.
    pub messages: mpsc::Receiver<Vec<u8>>,
    /// Non-fatal write errors.
    pub errors: mpsc::Receiver<TransportError>,
    /// Fires once when the connection closes.
    pub closed: oneshot::Receiver<CloseInfo>,
}

/// Single-fire closure notification shared by both tasks and the handle.
#[derive(Debug)]
struct Closure {
    notify: Mutex<Option<oneshot::Sender<CloseInfo>>>,
    cancel: CancellationToken,
}

impl Closure {
    /// Emit the closure notification. Returns `false` if it already fired.
    fn fire(&self, info: CloseInfo) -> bool {
        let sender = self
            .notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                log::debug!("[Transport] Closure: {info}");
                // Receiver may be gone; the guard is what matters.
                let _ = tx.send(info);
                true
            }
            None => false,
        }
    }

    fn has_fired(&self) -> bool {
        self.notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug)]
struct Shared {
    outbound: mpsc::Sender<Message>,
    close_request: Mutex<Option<oneshot::Sender<CloseInfo>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closure: Arc<Closure>,
}

/// Handle to one physical connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Take ownership of an established stream and start its read and write tasks.
    pub fn from_stream<S>(stream: WebSocketStream<S>) -> (Self, TransportEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = oneshot::channel();
        let (close_request_tx, close_request_rx) = oneshot::channel();

        let closure = Arc::new(Closure {
            notify: Mutex::new(Some(closed_tx)),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(read_loop(source, message_tx, Arc::clone(&closure)));
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            close_request_rx,
            error_tx,
            Arc::clone(&closure),
        ));

        let transport = Self {
            shared: Arc::new(Shared {
                outbound: outbound_tx,
                close_request: Mutex::new(Some(close_request_tx)),
                writer: Mutex::new(Some(writer)),
                closure,
            }),
        };
        let events = TransportEvents {
            messages: message_rx,
            errors: error_rx,
            closed: closed_rx,
        };
        (transport, events)
    }

    /// Enqueue a frame without blocking. Frames are written in enqueue order.
    pub fn write(&self, frame_type: FrameType, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = match frame_type {
            FrameType::Binary => Message::Binary(bytes),
            FrameType::Text => {
                Message::Text(String::from_utf8(bytes).map_err(TransportError::InvalidText)?)
            }
        };
        self.shared.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Send a close frame best-effort, then tear the connection down.
    ///
    /// Reports closure with `code` unless another cause already did.
    pub async fn close(&self, code: u16, reason: &str) {
        let info = CloseInfo::new(code, reason);
        let request = self
            .shared
            .close_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = request {
            let _ = tx.send(info.clone());
        }
        if self.shared.closure.fire(info) {
            log::info!("[Transport] Closing locally with code {code}");
        }

        let writer = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, handle).await.is_err() {
                log::warn!("[Transport] Close frame did not flush in time");
            }
        }
        self.shared.closure.cancel.cancel();
    }

    /// True once closure has been reported.
    pub fn is_closed(&self) -> bool {
        self.shared.closure.has_fired() || self.shared.closure.cancel.is_cancelled()
    }
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    messages: mpsc::Sender<Vec<u8>>,
    closure: Arc<Closure>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let info = loop {
        let next = tokio::select! {
            () = closure.cancel.cancelled() => return,
            next = source.next() => next,
        };
        let payload = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || CloseInfo::new(CLOSE_NO_STATUS, ""),
                    |frame| CloseInfo::new(frame.code.into(), frame.reason.into_owned()),
                );
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(err)) => break CloseInfo::new(CLOSE_ABNORMAL, err.to_string()),
            None => break CloseInfo::new(CLOSE_ABNORMAL, "connection ended"),
        };

        tokio::select! {
            () = closure.cancel.cancelled() => return,
            sent = messages.send(payload) => {
                if sent.is_err() {
                    log::debug!("[Transport] Message receiver dropped, stopping reader");
                    return;
                }
            }
        }
    };

    if closure.fire(info) {
        log::info!("[Transport] Connection closed by peer or read fault");
    }
    closure.cancel.cancel();
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Message>,
    mut close_request: oneshot::Receiver<CloseInfo>,
    errors: mpsc::Sender<TransportError>,
    closure: Arc<Closure>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            request = &mut close_request => {
                if let Ok(info) = request {
                    let frame = CloseFrame {
                        code: CloseCode::from(info.code),
                        reason: info.reason.into(),
                    };
                    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
                        Ok(Ok(())) => log::debug!("[Transport] Close frame sent"),
                        Ok(Err(err)) => log::debug!("[Transport] Close frame not sent: {err}"),
                        Err(_) => log::debug!("[Transport] Close frame timed out"),
                    }
                }
                break;
            }
            () = closure.cancel.cancelled() => break,
            next = outbound.recv() => {
                let Some(message) = next else { break };
                let sent = tokio::select! {
                    () = closure.cancel.cancelled() => break,
                    sent = sink.send(message) => sent,
                };
                if let Err(err) = sent {
                    if is_fatal(&err) {
                        closure.fire(CloseInfo::new(CLOSE_ABNORMAL, err.to_string()));
                        closure.cancel.cancel();
                        break;
                    }
                    log::warn!("[Transport] Write failed: {err}");
                    if errors.try_send(TransportError::Write(err)).is_err() {
                        log::warn!("[Transport] Error queue full, dropping write error");
                    }
                }
            }
        }
    }

    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
}

/// Write errors after which the connection is unusable.
fn is_fatal(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::UnexpectedEof
        ),
        tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        ) => true,
        _ => false,
    }
}
