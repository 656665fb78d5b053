//! Realtime listener: connection lifecycle, frame routing, reconnection.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─start─► Connecting ─► Connected ─► Disconnected ─► Reconnecting ─► Connected
//!                                              │                 │
//!                                              └──── no retry ───┴──────► Closed
//! ```
//!
//! All per-connection state (transport handle, cipher key, request counter,
//! keepalive token) lives in one [`Connection`] behind the listener's mutex.
//! It is swapped as a whole on every reconnect and dropped on teardown,
//! which wipes the cipher key.
//!
//! The parent [`CancellationToken`] passed to [`Listener::start`] spans the
//! whole reconnect chain. Closing a transport never cancels it; only
//! [`Listener::stop`] or an exhausted retry budget does.

mod dispatch;
mod keepalive;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::constants::{
    CLIENT_ORIGIN, CLOSE_MANUAL, CMD_OLD_GROUP_MESSAGES, CMD_OLD_GROUP_REACTIONS,
    CMD_OLD_USER_MESSAGES, CMD_OLD_USER_REACTIONS, FRAME_VERSION,
};
use crate::events::{Connected, EventStream, ListenerEvents, PublishOutcome};
use crate::frame::{CipherKey, DecodeError, Frame};
use crate::models::ThreadType;
use crate::retry::{EndpointRotation, RetryError, RetryPolicy};
use crate::session::{Session, SessionError};
use crate::transport::{FrameType, Transport, TransportError, TransportEvents};
use crate::ws::{redact_query, Connector, WsConnector};

/// Errors surfaced by the listener, either returned or published on the error stream.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// `start` was called while a connection chain is running.
    #[error("listener is already connected")]
    AlreadyConnected,
    /// The cancellation token was already cancelled.
    #[error("listener cancelled")]
    Cancelled,
    /// No connection to send on.
    #[error("listener is not connected")]
    NotConnected,
    /// Building the handshake failed.
    #[error("{op}: {source}")]
    Session {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: SessionError,
    },
    /// Dial or write fault.
    #[error("{op}: {source}")]
    Transport {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: TransportError,
    },
    /// An inbound frame could not be decoded; the frame was dropped.
    #[error("{op}: {source}")]
    Decode {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: DecodeError,
    },
    /// An outbound payload could not be serialized.
    #[error("encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    /// Reconnection could not be scheduled.
    #[error("reconnect: {0}")]
    Retry(#[from] RetryError),
    /// The server set a non-zero `error_code` on an envelope.
    #[error("server error {code}: {message}")]
    Server {
        /// Server error code.
        code: i64,
        /// Server error message.
        message: String,
    },
}

/// Coarse listener state, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    /// Never started.
    Idle,
    /// Dialing the first endpoint.
    Connecting,
    /// A connection is up.
    Connected,
    /// The connection just closed; deciding whether to retry.
    Disconnected,
    /// Waiting out a retry delay or redialing.
    Reconnecting,
    /// Stopped for good until the next `start`.
    Closed,
}

/// Outbound control frame for [`Listener::send_ws`].
#[derive(Debug, Clone, PartialEq)]
pub struct WsRequest {
    /// Protocol version.
    pub version: u8,
    /// Command number.
    pub command: u16,
    /// Subcommand number.
    pub subcommand: u8,
    /// JSON object body.
    pub data: Map<String, Value>,
}

impl WsRequest {
    /// Request with the current protocol version.
    pub fn new(command: (u16, u8), data: Map<String, Value>) -> Self {
        Self {
            version: FRAME_VERSION,
            command: command.0,
            subcommand: command.1,
            data,
        }
    }
}

/// State of one physical connection.
struct Connection {
    transport: Transport,
    cipher_key: Option<CipherKey>,
    request_counter: u64,
    token: CancellationToken,
    keepalive: Option<CancellationToken>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct State {
    phase: ListenerPhase,
    connection: Option<Connection>,
    retry: RetryPolicy,
    rotation: EndpointRotation,
    parent: Option<CancellationToken>,
    retry_on_close: bool,
}

struct Inner {
    session: Session,
    connector: Arc<dyn Connector>,
    events: ListenerEvents,
    state: Mutex<State>,
    tracker: TaskTracker,
}

/// Connection produced by a successful dial, handed to the dispatch loop.
struct Link {
    transport: Transport,
    events: TransportEvents,
}

/// Realtime event listener for one session. Cheap to clone.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("session", &self.inner.session)
            .field("phase", &self.state())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Listener dialing real WebSocket endpoints.
    pub fn new(session: Session) -> Self {
        Self::with_connector(session, Arc::new(WsConnector))
    }

    /// Listener dialing through `connector`.
    pub fn with_connector(session: Session, connector: Arc<dyn Connector>) -> Self {
        let settings = session.settings();
        let state = State {
            phase: ListenerPhase::Idle,
            connection: None,
            retry: RetryPolicy::from_settings(settings),
            rotation: EndpointRotation::new(
                session.endpoints().to_vec(),
                settings.rotate_error_codes.clone(),
            ),
            parent: None,
            retry_on_close: true,
        };
        Self {
            inner: Arc::new(Inner {
                session,
                connector,
                events: ListenerEvents::default(),
                state: Mutex::new(state),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Public event streams.
    pub fn events(&self) -> &ListenerEvents {
        &self.inner.events
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ListenerPhase {
        self.inner.lock().phase
    }

    /// Connect and start receiving.
    ///
    /// `token` scopes the whole reconnect chain; cancelling it is equivalent
    /// to [`stop`](Self::stop) without waiting. With `retry_on_close` unset
    /// the first closure ends the chain.
    pub async fn start(
        &self,
        token: CancellationToken,
        retry_on_close: bool,
    ) -> Result<(), ListenerError> {
        if token.is_cancelled() {
            return Err(ListenerError::Cancelled);
        }
        {
            let mut state = self.inner.lock();
            if !matches!(state.phase, ListenerPhase::Idle | ListenerPhase::Closed) {
                return Err(ListenerError::AlreadyConnected);
            }
            state.parent = Some(token.clone());
            state.retry_on_close = retry_on_close;
            state.retry.reset();
            state.rotation.reset();
            state.phase = ListenerPhase::Connecting;
        }
        self.inner.tracker.reopen();
        self.inner.events.reopen();

        let link = match self.inner.connect(&token).await {
            Ok(link) => link,
            Err(err) => {
                self.inner.lock().phase = ListenerPhase::Closed;
                return Err(err);
            }
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(inner.supervise(token, link));
        Ok(())
    }

    /// Cancel the chain, close the connection with the manual code, and wait
    /// for every background task to finish.
    pub async fn stop(&self) {
        let (parent, transport) = {
            let state = self.inner.lock();
            (
                state.parent.clone(),
                state.connection.as_ref().map(|c| c.transport.clone()),
            )
        };
        if let Some(parent) = parent {
            parent.cancel();
        }
        if let Some(transport) = transport {
            transport.close(CLOSE_MANUAL, "manual close").await;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        log::info!("[Listener] Stopped");
    }

    /// Encode and enqueue an outbound frame.
    ///
    /// With `require_id`, the body is stamped with `req_id = "req_<n>"` where
    /// `n` counts up from zero per connection.
    pub fn send_ws(&self, mut request: WsRequest, require_id: bool) -> Result<(), ListenerError> {
        let mut state = self.inner.lock();
        if state.parent.as_ref().is_none_or(CancellationToken::is_cancelled) {
            return Err(ListenerError::Cancelled);
        }
        let connection = state
            .connection
            .as_mut()
            .ok_or(ListenerError::NotConnected)?;

        if require_id {
            request.data.insert(
                "req_id".to_string(),
                Value::String(format!("req_{}", connection.request_counter)),
            );
            connection.request_counter += 1;
        }
        let frame = Frame::json(
            request.version,
            request.command,
            request.subcommand,
            &request.data,
        )
        .map_err(ListenerError::Encode)?;

        // Enqueued under the lock so request ids reach the wire in order.
        connection
            .transport
            .write(FrameType::Binary, frame.encode())
            .map_err(|source| ListenerError::Transport { op: "send", source })
    }

    /// Ask the server for messages older than `last_id`.
    pub fn request_old_messages(
        &self,
        thread_type: ThreadType,
        last_id: Option<&str>,
    ) -> Result<(), ListenerError> {
        let command = match thread_type {
            ThreadType::User => CMD_OLD_USER_MESSAGES,
            ThreadType::Group => CMD_OLD_GROUP_MESSAGES,
        };
        self.send_ws(WsRequest::new(command, backfill_body(last_id)), true)
    }

    /// Ask the server for reactions older than `last_id`.
    pub fn request_old_reactions(
        &self,
        thread_type: ThreadType,
        last_id: Option<&str>,
    ) -> Result<(), ListenerError> {
        let command = match thread_type {
            ThreadType::User => CMD_OLD_USER_REACTIONS,
            ThreadType::Group => CMD_OLD_GROUP_REACTIONS,
        };
        self.send_ws(WsRequest::new(command, backfill_body(last_id)), true)
    }
}

fn backfill_body(last_id: Option<&str>) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("first".to_string(), Value::Bool(true));
    body.insert(
        "lastId".to_string(),
        last_id.map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    body.insert("preIds".to_string(), Value::Array(Vec::new()));
    body
}

/// Headers the web client sends on the socket handshake.
fn handshake_headers(session: &Session) -> Vec<(String, String)> {
    let mut headers = vec![
        ("accept-language".to_string(), session.language().to_string()),
        ("cache-control".to_string(), "no-cache".to_string()),
        ("origin".to_string(), CLIENT_ORIGIN.to_string()),
        ("user-agent".to_string(), session.user_agent().to_string()),
    ];
    if let Some(cookie) = session.cookie_header() {
        headers.push(("cookie".to_string(), cookie));
    }
    headers
}

/// Publish without blocking, logging anything the drop policy discards.
fn emit<T>(stream: &EventStream<T>, name: &str, value: T) {
    match stream.publish(value) {
        PublishOutcome::Delivered => {}
        outcome => log::warn!("[Listener] {name} stream full: {outcome:?}"),
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, err: ListenerError) {
        log::warn!("[Listener] {err}");
        emit(&self.events.error, "error", err);
    }

    /// Dial the current endpoint and install a fresh [`Connection`].
    async fn connect(&self, parent: &CancellationToken) -> Result<Link, ListenerError> {
        let endpoint = self
            .lock()
            .rotation
            .current()
            .map(str::to_string)
            .ok_or(ListenerError::Session {
                op: "select endpoint",
                source: SessionError::NoEndpoints,
            })?;
        let url = self
            .session
            .handshake_url(&endpoint, chrono::Utc::now().timestamp_millis())
            .map_err(|source| ListenerError::Session {
                op: "build handshake url",
                source,
            })?;

        log::info!("[Listener] Connecting to {}", redact_query(&url));
        let (transport, events) = self
            .connector
            .dial(&url, &handshake_headers(&self.session))
            .await
            .map_err(|source| ListenerError::Transport { op: "dial", source })?;

        {
            let mut state = self.lock();
            if !parent.is_cancelled() {
                state.connection = Some(Connection {
                    transport: transport.clone(),
                    cipher_key: None,
                    request_counter: 0,
                    token: parent.child_token(),
                    keepalive: None,
                });
                state.phase = ListenerPhase::Connected;
            }
        }
        if parent.is_cancelled() {
            transport.close(CLOSE_MANUAL, "cancelled during dial").await;
            return Err(ListenerError::Cancelled);
        }

        log::info!("[Listener] Connected to {endpoint}");
        emit(&self.events.connected, "connected", Connected { endpoint });
        Ok(Link { transport, events })
    }
}
