//! Realtime client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// A broadcast message awaiting acknowledgment on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// One authenticated WebSocket client.
///
/// Frames are queued on a bounded channel drained by the socket's writer
/// task, so every outbound frame for a connection goes through one writer.
/// The session association is changed only through the
/// [`ConnectionPool`](super::pool::ConnectionPool) so its index stays in step.
pub struct Connection {
    id: String,
    user_id: String,
    session_id: RwLock<Option<Uuid>>,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    tx: mpsc::Sender<Arc<String>>,
    pending: DashMap<Uuid, PendingAck>,
    dropped_frames: AtomicU64,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            session_id: RwLock::new(None),
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            tx,
            pending: DashMap::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Create a connection together with the receiving end of its queue.
    pub fn channel(
        id: impl Into<String>,
        user_id: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(id, user_id, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The session this connection is currently joined to.
    pub fn session_id(&self) -> Option<Uuid> {
        *self.session_id.read()
    }

    pub(crate) fn set_session(&self, session_id: Option<Uuid>) -> Option<Uuid> {
        std::mem::replace(&mut *self.session_id.write(), session_id)
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or since connecting).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Queue a frame for the writer task.
    ///
    /// Returns `false` if the queue is full or the writer has gone away; a
    /// full queue counts as a dropped frame.
    pub fn send(&self, frame: Arc<String>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize `value` and queue it.
    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Whether the writer task has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Frames dropped because the outbound queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Start tracking `message_id` as awaiting acknowledgment.
    pub fn track_pending(&self, message_id: Uuid) {
        self.pending.insert(
            message_id,
            PendingAck {
                sent_at: Utc::now(),
                retry_count: 0,
            },
        );
    }

    pub fn is_pending(&self, message_id: &Uuid) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_ack(&self, message_id: &Uuid) -> Option<PendingAck> {
        self.pending.get(message_id).map(|p| *p)
    }

    /// Record a redelivery, returning the new retry count.
    pub fn record_retry(&self, message_id: &Uuid) -> Option<u32> {
        self.pending.get_mut(message_id).map(|mut p| {
            p.retry_count += 1;
            p.sent_at = Utc::now();
            p.retry_count
        })
    }

    /// Stop tracking `message_id`. Returns whether it was pending.
    pub fn acknowledge(&self, message_id: &Uuid) -> bool {
        self.pending.remove(message_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear_pending(&self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id())
            .field("pending", &self.pending.len())
            .finish()
    }
}
