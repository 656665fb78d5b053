//! Protocol-wide constants for zwire.
//!
//! This module centralizes close codes, command triples, and the defaults
//! the realtime client falls back to when the session does not override them.
//!
//! # Categories
//!
//! - **Close codes**: meanings the server and client attach to socket closure
//! - **Commands**: reserved `(version, command, subcommand)` triples
//! - **Handshake**: header values and signing prefixes for the dial
//! - **Queues**: capacities of the transport and event-stream buffers

use std::time::Duration;

// ============================================================================
// Close codes
// ============================================================================

/// Close code used when the client shuts the connection down on purpose.
pub const CLOSE_MANUAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code reported when the peer's close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code used after the server reports a second connection for this session.
pub const CLOSE_DUPLICATE_CONNECTION: u16 = 3000;

/// Close code the server uses to kick a connection.
pub const CLOSE_KICK_CONNECTION: u16 = 3003;

/// Close codes that carry protocol-level intent and are never retried,
/// even when a retry table lists them.
pub const NEVER_RETRY_CODES: &[u16] = &[CLOSE_DUPLICATE_CONNECTION, CLOSE_KICK_CONNECTION];

// ============================================================================
// Commands
// ============================================================================

/// Protocol version carried by every frame this client understands.
pub const FRAME_VERSION: u8 = 1;

/// Size of the binary frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Cipher-key push `(1, 1, 1)`.
pub const CMD_CIPHER_KEY: (u16, u8) = (1, 1);

/// Client keepalive ping `(1, 2, 1)`.
pub const CMD_PING: (u16, u8) = (2, 1);

/// Direct message / undo batch `(1, 501, 0)`.
pub const CMD_USER_MESSAGES: (u16, u8) = (501, 0);

/// Group message / undo batch `(1, 521, 0)`.
pub const CMD_GROUP_MESSAGES: (u16, u8) = (521, 0);

/// Old direct-message backfill `(1, 510, 1)`.
pub const CMD_OLD_USER_MESSAGES: (u16, u8) = (510, 1);

/// Old group-message backfill `(1, 511, 1)`.
pub const CMD_OLD_GROUP_MESSAGES: (u16, u8) = (511, 1);

/// Old direct-thread reaction backfill `(1, 610, 1)`.
pub const CMD_OLD_USER_REACTIONS: (u16, u8) = (610, 1);

/// Old group reaction backfill `(1, 611, 1)`.
pub const CMD_OLD_GROUP_REACTIONS: (u16, u8) = (611, 1);

/// Duplicate-connection kick `(1, 3000, 0)`.
pub const CMD_DUPLICATE_CONNECTION: (u16, u8) = (3000, 0);

// ============================================================================
// Cryptography
// ============================================================================

/// Well-known AES key used to seal the device identifier token.
pub const ZCID_KEY: &str = "3FC4F0D2AB50057BCE0D90D9187A22B1";

/// Encryption version advertised next to the device identifier token.
pub const ENC_VERSION: &str = "v2";

/// Literal prefix of every signkey input.
pub const SIGN_PREFIX: &str = "zsecure";

/// Call type mixed into the signkey of the socket handshake URL.
pub const HANDSHAKE_SIGN_TYPE: &str = "listen";

// ============================================================================
// Handshake
// ============================================================================

/// Origin header sent with the socket handshake and HTTP calls.
pub const CLIENT_ORIGIN: &str = "https://chat.zalo.me";

/// Default `accept-language` header value.
pub const DEFAULT_LANGUAGE: &str = "vi";

/// HTTP request timeout for collaborator calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the transport waits for a close frame to flush before tearing down.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the dispatch loop waits for the transport to confirm closure
/// after the parent token fires.
pub const CLOSE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Queues
// ============================================================================

/// Capacity of the transport's outbound write queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the transport's inbound message queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of each public event stream.
pub const EVENT_STREAM_CAPACITY: usize = 64;
