//! Fan-out of outbound frames to groups of connections.

use std::sync::Arc;

use parley_types::envelope::{OutboundEnvelope, ServerEvent};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::Connection;
use super::pool::ConnectionPool;
use super::retry::RetryManager;

/// Who a frame goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Every connection joined to the session.
    Session(Uuid),
    /// Every connection of the user, whatever session it is on.
    User(String),
}

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub queued: usize,
    pub dropped: usize,
}

/// Serializes a frame once and queues it on every target connection.
///
/// Queuing never blocks: a full or closed connection queue counts the frame
/// as dropped for that recipient and the rest still receive it.
pub struct Broadcaster {
    pool: Arc<ConnectionPool>,
    retry: Arc<RetryManager>,
}

impl Broadcaster {
    pub fn new(pool: Arc<ConnectionPool>, retry: Arc<RetryManager>) -> Self {
        Self { pool, retry }
    }

    fn members(&self, target: &BroadcastTarget) -> Vec<Arc<Connection>> {
        match target {
            BroadcastTarget::Session(id) => self.pool.by_session(id),
            BroadcastTarget::User(user_id) => self.pool.by_user(user_id),
        }
    }

    fn encode<T: Serialize>(payload: &T) -> Option<Arc<String>> {
        match serde_json::to_string(payload) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound frame");
                None
            }
        }
    }

    /// Send a chat envelope to `target`.
    ///
    /// Successful envelopes carrying a message are tracked for
    /// acknowledgment on every connection they were queued to.
    pub fn broadcast(&self, target: &BroadcastTarget, envelope: &OutboundEnvelope) -> BroadcastReport {
        let Some(frame) = Self::encode(envelope) else {
            return BroadcastReport::default();
        };
        let ack = envelope.message_id().filter(|_| envelope.success);
        self.fan_out(target, frame, None, ack)
    }

    /// Send a transient event to `target`, optionally skipping one connection.
    pub fn broadcast_event(
        &self,
        target: &BroadcastTarget,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> BroadcastReport {
        let Some(frame) = Self::encode(event) else {
            return BroadcastReport::default();
        };
        self.fan_out(target, frame, exclude, None)
    }

    /// Send a payload to exactly one connection, without ack tracking.
    pub fn send_to<T: Serialize>(&self, conn: &Connection, payload: &T) -> bool {
        match Self::encode(payload) {
            Some(frame) => conn.send(frame),
            None => false,
        }
    }

    fn fan_out(
        &self,
        target: &BroadcastTarget,
        frame: Arc<String>,
        exclude: Option<&str>,
        ack: Option<Uuid>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.members(target) {
            if exclude == Some(conn.id()) {
                continue;
            }
            report.recipients += 1;
            if conn.send(Arc::clone(&frame)) {
                report.queued += 1;
                if let Some(message_id) = ack {
                    self.retry.track(&conn, message_id, Arc::clone(&frame));
                }
            } else {
                report.dropped += 1;
                warn!(connection_id = %conn.id(), "Outbound queue full or closed, frame dropped");
            }
        }
        debug!(
            target_group = ?target,
            recipients = report.recipients,
            dropped = report.dropped,
            "Broadcast frame"
        );
        report
    }
}
