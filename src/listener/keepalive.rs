//! Periodic client ping.
//!
//! Started on every cipher-key delivery, replacing the previous task, and
//! stopped when its token (a child of the connection token) fires.

use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::constants::{CMD_PING, FRAME_VERSION};
use crate::frame::Frame;
use crate::transport::{FrameType, Transport, TransportError};

/// Ping frame body: the current time as an event id.
fn ping_frame(now_ms: i64) -> Result<Frame, serde_json::Error> {
    Frame::json(FRAME_VERSION, CMD_PING.0, CMD_PING.1, &json!({ "eventId": now_ms }))
}

/// Send a ping immediately, then on every tick, until `token` fires.
pub(super) async fn run(transport: Transport, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!("[Keepalive] Started, interval {interval:?}");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let frame = match ping_frame(chrono::Utc::now().timestamp_millis()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("[Keepalive] Ping encode failed: {err}");
                        continue;
                    }
                };
                match transport.write(FrameType::Binary, frame.encode()) {
                    Ok(()) => log::trace!("[Keepalive] Ping sent"),
                    Err(TransportError::Closed) => break,
                    Err(err) => log::warn!("[Keepalive] Ping failed: {err}"),
                }
            }
        }
    }
    log::debug!("[Keepalive] Stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame_layout() {
        let frame = ping_frame(1_700_000_000_000).unwrap();
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &[1, 2, 0, 1]);
        let body: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(body, json!({"eventId": 1_700_000_000_000_i64}));
    }
}
