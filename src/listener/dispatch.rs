//! Receive loop, frame routing, and the reconnect chain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{emit, keepalive, Inner, Link, ListenerError, ListenerPhase};
use crate::constants::{CLOSE_ABNORMAL, CLOSE_CONFIRM_TIMEOUT, CLOSE_DUPLICATE_CONNECTION, CLOSE_MANUAL};
use crate::frame::{CipherKey, DecodeError, Envelope, Frame, FrameKind};
use crate::models::{BatchItem, Message, MessageBatch, OldMessages, ThreadType};
use crate::transport::{CloseInfo, Transport, TransportEvents};

impl Inner {
    /// Drive one connection after another until the chain ends.
    pub(super) async fn supervise(self: Arc<Self>, parent: CancellationToken, mut link: Link) {
        loop {
            let mut info = self.dispatch(link, &parent).await;
            self.teardown(&info);
            link = loop {
                let Some(delay) = self.next_retry(&info, &parent) else {
                    return;
                };

                log::info!("[Listener] Reconnecting in {delay:?} after {info}");
                tokio::select! {
                    () = parent.cancelled() => {
                        self.finish(&info, &parent);
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                match self.connect(&parent).await {
                    Ok(link) => break link,
                    Err(_) if parent.is_cancelled() => {
                        self.finish(&info, &parent);
                        return;
                    }
                    // The dial produced no connection to tear down.
                    Err(err) => {
                        self.report(err);
                        info = CloseInfo::new(CLOSE_ABNORMAL, "reconnect failed");
                    }
                }
            };
        }
    }

    /// Multiplex one transport's outputs until it closes or the parent fires.
    async fn dispatch(&self, link: Link, parent: &CancellationToken) -> CloseInfo {
        let Link {
            transport,
            events:
                TransportEvents {
                    mut messages,
                    mut errors,
                    mut closed,
                },
        } = link;

        loop {
            tokio::select! {
                biased;

                () = parent.cancelled() => {
                    transport.close(CLOSE_MANUAL, "manual close").await;
                    return match tokio::time::timeout(CLOSE_CONFIRM_TIMEOUT, &mut closed).await {
                        Ok(Ok(info)) => info,
                        _ => CloseInfo::new(CLOSE_MANUAL, "manual close"),
                    };
                }
                Some(bytes) = messages.recv() => self.handle_frame(&transport, &bytes).await,
                Some(err) = errors.recv() => {
                    self.report(ListenerError::Transport { op: "write", source: err });
                }
                closed = &mut closed => {
                    return closed.unwrap_or_else(|_| CloseInfo::new(CLOSE_ABNORMAL, "transport dropped"));
                }
            }
        }
    }

    async fn handle_frame(&self, transport: &Transport, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(source) => {
                self.report(ListenerError::Decode { op: "frame header", source });
                return;
            }
        };

        let kind = frame.kind();
        log::trace!(
            "[Listener] Frame ({}, {}, {}) -> {kind:?}",
            frame.version,
            frame.command,
            frame.subcommand
        );
        match kind {
            FrameKind::Unknown | FrameKind::Ping => return,
            FrameKind::DuplicateConnection => {
                log::error!("[Listener] Another connection opened for this session, closing");
                transport
                    .close(CLOSE_DUPLICATE_CONNECTION, "duplicate connection")
                    .await;
                return;
            }
            _ => {}
        }

        let envelope = match Envelope::parse(&frame.body) {
            Ok(envelope) => envelope,
            Err(source) => {
                self.report(ListenerError::Decode { op: "envelope", source });
                return;
            }
        };
        if envelope.error_code != 0 {
            self.report(ListenerError::Server {
                code: envelope.error_code,
                message: envelope.error_message,
            });
            return;
        }

        match kind {
            FrameKind::CipherKey => self.on_cipher_key(envelope),
            FrameKind::Messages(thread_type) => self.on_messages(&envelope, thread_type),
            FrameKind::OldMessages(thread_type) => self.on_old_messages(&envelope, thread_type),
            FrameKind::OldReactions(thread_type) => {
                log::debug!("[Listener] Ignoring old reactions reply for {thread_type:?}");
            }
            FrameKind::Ping | FrameKind::DuplicateConnection | FrameKind::Unknown => {}
        }
    }

    fn on_cipher_key(&self, envelope: Envelope) {
        let Some(key) = envelope.key.filter(|key| !key.is_empty()) else {
            self.report(ListenerError::Decode {
                op: "cipher key",
                source: DecodeError::NoKeyInFrame,
            });
            return;
        };
        let key = CipherKey::new(key);
        let interval = Duration::from_millis(self.session.settings().ping_interval);

        let keepalive = {
            let mut state = self.lock();
            let Some(connection) = state.connection.as_mut() else {
                return;
            };
            connection.cipher_key = Some(key.clone());
            if let Some(previous) = connection.keepalive.take() {
                previous.cancel();
            }
            (!interval.is_zero()).then(|| {
                let token = connection.token.child_token();
                connection.keepalive = Some(token.clone());
                (connection.transport.clone(), token)
            })
        };

        log::info!("[Listener] Cipher key received");
        emit(&self.events.cipher_key, "cipher_key", key);
        if let Some((transport, token)) = keepalive {
            self.tracker
                .spawn(keepalive::run(transport, token, interval));
        }
    }

    fn cipher_key(&self) -> Option<CipherKey> {
        self.lock()
            .connection
            .as_ref()
            .and_then(|connection| connection.cipher_key.clone())
    }

    fn decode_batch(
        &self,
        envelope: &Envelope,
        thread_type: ThreadType,
        op: &'static str,
    ) -> Option<Vec<BatchItem>> {
        let batch: MessageBatch = match envelope.decode_data(self.cipher_key().as_ref()) {
            Ok(batch) => batch,
            Err(source) => {
                self.report(ListenerError::Decode { op, source });
                return None;
            }
        };

        let uid = self.session.uid();
        let items = batch
            .into_items(thread_type)
            .into_iter()
            .filter_map(|raw| match BatchItem::classify(uid, thread_type, raw) {
                Ok(item) => Some(item),
                Err(err) => {
                    self.report(ListenerError::Decode {
                        op,
                        source: DecodeError::Json(err),
                    });
                    None
                }
            })
            .collect();
        Some(items)
    }

    fn on_messages(&self, envelope: &Envelope, thread_type: ThreadType) {
        let Some(items) = self.decode_batch(envelope, thread_type, "message batch") else {
            return;
        };
        let self_listen = self.session.self_listen();
        for item in items {
            if item.is_self() && !self_listen {
                log::trace!("[Listener] Skipping own item");
                continue;
            }
            match item {
                BatchItem::Message(message) => emit(&self.events.message, "message", message),
                BatchItem::Undo(undo) => emit(&self.events.undo, "undo", undo),
            }
        }
    }

    fn on_old_messages(&self, envelope: &Envelope, thread_type: ThreadType) {
        let Some(items) = self.decode_batch(envelope, thread_type, "old messages") else {
            return;
        };
        let messages: Vec<Message> = items
            .into_iter()
            .filter_map(|item| match item {
                BatchItem::Message(message) => Some(message),
                BatchItem::Undo(_) => None,
            })
            .collect();
        log::debug!("[Listener] {} old messages received", messages.len());
        emit(
            &self.events.old_messages,
            "old_messages",
            OldMessages {
                thread_type,
                messages,
            },
        );
    }

    /// Drop per-connection state and announce the disconnect.
    fn teardown(&self, info: &CloseInfo) {
        let connection = {
            let mut state = self.lock();
            state.phase = ListenerPhase::Disconnected;
            state.connection.take()
        };
        // Dropping the connection cancels its token and wipes the cipher key.
        drop(connection);
        log::info!("[Listener] Disconnected: {info}");
        emit(&self.events.disconnected, "disconnected", info.clone());
    }

    /// Decide whether to reconnect, rotating the endpoint if the code asks for it.
    ///
    /// Returns `None` after entering the closed state.
    fn next_retry(&self, info: &CloseInfo, parent: &CancellationToken) -> Option<Duration> {
        let decision = {
            let mut state = self.lock();
            if !state.retry_on_close || parent.is_cancelled() {
                None
            } else if let Some(delay) = state.retry.can_retry(info.code) {
                let rotated = if state.rotation.should_rotate(info.code) {
                    state.rotation.rotate().map(|endpoint| {
                        log::info!("[Listener] Rotating to {endpoint}");
                    })
                } else {
                    Ok(())
                };
                match rotated {
                    Ok(()) => {
                        state.phase = ListenerPhase::Reconnecting;
                        Some(Ok(delay))
                    }
                    Err(err) => Some(Err(err)),
                }
            } else {
                None
            }
        };

        match decision {
            Some(Ok(delay)) => Some(delay),
            Some(Err(err)) => {
                log::error!("[Listener] Cannot reconnect: {err}");
                self.report(err.into());
                self.finish(info, parent);
                None
            }
            None => {
                self.finish(info, parent);
                None
            }
        }
    }

    /// Enter the closed state, publish the final event, and end every stream.
    fn finish(&self, info: &CloseInfo, parent: &CancellationToken) {
        self.lock().phase = ListenerPhase::Closed;
        log::info!("[Listener] Closed: {info}");
        emit(&self.events.closed, "closed", info.clone());
        self.events.close();
        parent.cancel();
    }
}
