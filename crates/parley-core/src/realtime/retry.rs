//! Acknowledgment tracking and redelivery.
//!
//! Every message broadcast with ack tracking gets a timer task per
//! recipient connection. If no ack arrives within the ack timeout the frame
//! is sent again, up to `max_retries` times; one more unacknowledged timeout
//! after the last redelivery reports a [`DeliveryFailure`].
//!
//! Timer tasks hang off a per-connection parent [`CancellationToken`], so
//! removing a connection abandons all of its retries at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_types::config::DeliveryConfig;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::Connection;

/// A message that exhausted its redeliveries on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub connection_id: String,
    pub user_id: String,
    pub session_id: Option<Uuid>,
    pub message_id: Uuid,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOutcome {
    Acknowledged,
    Cancelled,
    Failed,
}

struct PendingRetry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetryStats {
    pub pending: usize,
    pub tracked_connections: usize,
    pub redeliveries: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub abandoned: u64,
}

/// Owns the retry timers for every tracked (connection, message) pair.
pub struct RetryManager {
    ack_timeout: Duration,
    max_retries: u32,
    connections: DashMap<String, CancellationToken>,
    pending: DashMap<(String, Uuid), PendingRetry>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    generation: AtomicU64,
    redeliveries: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl RetryManager {
    /// Create a manager and the receiver its delivery failures are sent to.
    pub fn new(config: &DeliveryConfig) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
            connections: DashMap::new(),
            pending: DashMap::new(),
            failures: tx,
            generation: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        };
        (manager, rx)
    }

    /// Start the ack timer for `message_id` on `conn`.
    ///
    /// `frame` is the already-serialized payload, resent verbatim on each
    /// redelivery. Must be called from within a Tokio runtime.
    pub fn track(self: &Arc<Self>, conn: &Arc<Connection>, message_id: Uuid, frame: Arc<String>) {
        conn.track_pending(message_id);

        let parent = self
            .connections
            .entry(conn.id().to_string())
            .or_default()
            .clone();
        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key = (conn.id().to_string(), message_id);
        if let Some(previous) = self.pending.insert(
            key.clone(),
            PendingRetry {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let manager = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let outcome = manager.retry_loop(&conn, message_id, &frame, &token).await;
            manager
                .pending
                .remove_if(&key, |_, p| p.generation == generation);
            if outcome == RetryOutcome::Cancelled {
                debug!(connection_id = %conn.id(), message_id = %message_id, "Retry cancelled");
            }
        });
    }

    async fn retry_loop(
        &self,
        conn: &Connection,
        message_id: Uuid,
        frame: &Arc<String>,
        token: &CancellationToken,
    ) -> RetryOutcome {
        let mut redelivered = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(self.ack_timeout) => {}
            }

            if !conn.is_pending(&message_id) {
                return RetryOutcome::Acknowledged;
            }

            if redelivered >= self.max_retries {
                conn.acknowledge(&message_id);
                self.report_failure(conn, message_id, redelivered + 1);
                return RetryOutcome::Failed;
            }

            redelivered = conn.record_retry(&message_id).unwrap_or(redelivered + 1);
            self.redeliveries.fetch_add(1, Ordering::Relaxed);
            if conn.send(Arc::clone(frame)) {
                debug!(
                    connection_id = %conn.id(),
                    message_id = %message_id,
                    attempt = redelivered,
                    "Redelivered unacknowledged message"
                );
            } else {
                warn!(
                    connection_id = %conn.id(),
                    message_id = %message_id,
                    attempt = redelivered,
                    "Redelivery could not be queued"
                );
            }
        }
    }

    fn report_failure(&self, conn: &Connection, message_id: Uuid, attempts: u32) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            connection_id = %conn.id(),
            user_id = %conn.user_id(),
            message_id = %message_id,
            attempts,
            "Message delivery failed, no acknowledgment received"
        );
        let failure = DeliveryFailure {
            connection_id: conn.id().to_string(),
            user_id: conn.user_id().to_string(),
            session_id: conn.session_id(),
            message_id,
            attempts,
            failed_at: Utc::now(),
        };
        if self.failures.send(failure).is_err() {
            debug!(message_id = %message_id, "No delivery failure recorder attached");
        }
    }

    /// Handle an ack from `conn`. Returns whether the message was pending.
    pub fn on_ack(&self, conn: &Connection, message_id: &Uuid) -> bool {
        let was_pending = conn.acknowledge(message_id);
        if let Some((_, retry)) = self.pending.remove(&(conn.id().to_string(), *message_id)) {
            retry.token.cancel();
        }
        if was_pending {
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
        }
        was_pending
    }

    /// Abandon every retry for a connection without reporting failures.
    ///
    /// Returns how many pending messages were abandoned.
    pub fn cancel_connection(&self, connection_id: &str) -> usize {
        if let Some((_, parent)) = self.connections.remove(connection_id) {
            parent.cancel();
        }
        let before = self.pending.len();
        self.pending.retain(|(conn, _), _| conn != connection_id);
        let abandoned = before.saturating_sub(self.pending.len());
        self.abandoned
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        abandoned
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            pending: self.pending.len(),
            tracked_connections: self.connections.len(),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}
