//! Bounded, non-blocking public event streams.
//!
//! Every stream is a fixed-capacity queue. Publishing never blocks the
//! protocol loop: when the queue is full the oldest buffered value is
//! evicted to admit the new one, and if it still does not fit (capacity 0)
//! the new value itself is dropped. A slow or absent consumer may therefore
//! miss events but can never stall the listener.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::constants::EVENT_STREAM_CAPACITY;
use crate::frame::CipherKey;
use crate::listener::ListenerError;
use crate::models::{Message, OldMessages, Undo};
use crate::transport::CloseInfo;

/// Result of a single [`EventStream::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued without eviction.
    Delivered,
    /// Queued after evicting the oldest value.
    DroppedOldest,
    /// The value itself was dropped.
    DroppedNewest,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Multi-producer, single-consumer drop-oldest queue.
///
/// Cloning yields another handle onto the same queue.
pub struct EventStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T> EventStream<T> {
    /// Create a stream holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `value` without blocking, evicting the oldest value if full.
    pub fn publish(&self, value: T) -> PublishOutcome {
        let outcome = {
            let mut queue = self.lock();
            if queue.len() < self.shared.capacity {
                queue.push_back(value);
                PublishOutcome::Delivered
            } else {
                // Evict once, then retry once.
                queue.pop_front();
                if queue.len() < self.shared.capacity {
                    queue.push_back(value);
                    PublishOutcome::DroppedOldest
                } else {
                    PublishOutcome::DroppedNewest
                }
            }
        };

        match outcome {
            PublishOutcome::Delivered => {}
            PublishOutcome::DroppedOldest | PublishOutcome::DroppedNewest => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        if outcome != PublishOutcome::DroppedNewest {
            self.shared.notify.notify_one();
        }
        outcome
    }

    /// Take the oldest value if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait for the next value. Returns `None` once the stream is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Registered before checking, so a close in between still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_recv() {
                return Some(value);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Mark the stream finished. Buffered values remain receivable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    /// Accept receivers again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.shared.closed.store(false, Ordering::Release);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Values lost to the drop policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Clone> EventStream<T> {
    /// Copy of the buffered values, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }
}

/// Emitted once per successful dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    /// Endpoint the connection was made to.
    pub endpoint: String,
}

/// The public event surface of a [`Listener`](crate::listener::Listener).
#[derive(Debug, Clone)]
pub struct ListenerEvents {
    /// A connection was established.
    pub connected: EventStream<Connected>,
    /// A connection closed; a reconnect may follow.
    pub disconnected: EventStream<CloseInfo>,
    /// The listener stopped for good.
    pub closed: EventStream<CloseInfo>,
    /// Non-fatal errors: transport, decode, server error codes.
    pub error: EventStream<ListenerError>,
    /// Decoded chat messages.
    pub message: EventStream<Message>,
    /// Decoded recall notifications.
    pub undo: EventStream<Undo>,
    /// Cipher keys as delivered.
    pub cipher_key: EventStream<CipherKey>,
    /// Replies to old-message backfill requests.
    pub old_messages: EventStream<OldMessages>,
}

impl ListenerEvents {
    /// Create every stream with the same capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connected: EventStream::new(capacity),
            disconnected: EventStream::new(capacity),
            closed: EventStream::new(capacity),
            error: EventStream::new(capacity),
            message: EventStream::new(capacity),
            undo: EventStream::new(capacity),
            cipher_key: EventStream::new(capacity),
            old_messages: EventStream::new(capacity),
        }
    }

    /// Close every stream; receivers drain what is buffered, then see `None`.
    pub fn close(&self) {
        self.connected.close();
        self.disconnected.close();
        self.closed.close();
        self.error.close();
        self.message.close();
        self.undo.close();
        self.cipher_key.close();
        self.old_messages.close();
    }

    /// Reopen every stream for a new connection chain.
    pub fn reopen(&self) {
        self.connected.reopen();
        self.disconnected.reopen();
        self.closed.reopen();
        self.error.reopen();
        self.message.reopen();
        self.undo.reopen();
        self.cipher_key.reopen();
        self.old_messages.reopen();
    }
}

impl Default for ListenerEvents {
    fn default() -> Self {
        Self::with_capacity(EVENT_STREAM_CAPACITY)
    }
}
