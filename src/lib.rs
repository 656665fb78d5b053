//! zwire - realtime client for a private instant-messaging wire protocol.
//!
//! The crate covers two tightly coupled layers:
//!
//! - **Request cryptography** - device identifier tokens, per-request key
//!   derivation, body sealing, and `signkey` signatures used by both HTTP
//!   calls and the socket handshake.
//! - **Realtime transport** - a persistent WebSocket client that frames and
//!   unframes the binary protocol, decrypts push events under a cipher key
//!   delivered mid-session, reconnects under server-supplied retry tables,
//!   and republishes decoded events on bounded, non-blocking streams.
//!
//! # Modules
//!
//! - [`listener`] - connection lifecycle, routing, reconnection
//! - [`transport`] - one physical connection (read/write tasks)
//! - [`frame`] - binary header and encrypted-envelope codec
//! - [`params`] - request key derivation and signing
//! - [`api`] - encrypted HTTP request primitive
//! - [`config`] - session material for the `zwire` binary

pub mod api;
pub mod compression;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod events;
pub mod frame;
pub mod listener;
pub mod models;
pub mod params;
pub mod retry;
pub mod session;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use api::{ApiClient, ApiError};
pub use config::Config;
pub use events::{EventStream, ListenerEvents, PublishOutcome};
pub use frame::{CipherKey, DecodeError, Envelope, Frame, FrameKind};
pub use listener::{Listener, ListenerError, ListenerPhase, WsRequest};
pub use models::{Message, ThreadType, Undo};
pub use session::{Session, SocketSettings};
pub use transport::{CloseInfo, Transport, TransportError, TransportEvents};
pub use ws::{Connector, WsConnector};
