//! Registry of live connections.
//!
//! The pool is the only place connections are added, removed, or moved
//! between sessions. Secondary indexes by user and by session are kept
//! alongside the primary map; lookups through an index re-check the
//! connection itself, so a lookup racing a move never returns a connection
//! that is not actually in the requested group.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::Connection;
use super::rate_limit::RateLimiter;
use super::retry::RetryManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub users: usize,
    pub sessions: usize,
    pub pending_acks: usize,
}

/// Thread-safe connection registry with user and session indexes.
///
/// Never holds a guard on one map while touching another.
pub struct ConnectionPool {
    connections: DashMap<String, Arc<Connection>>,
    by_user: DashMap<String, HashSet<String>>,
    by_session: DashMap<Uuid, HashSet<String>>,
    retry: Arc<RetryManager>,
    idle_timeout: Duration,
}

fn index_add<K: Eq + Hash>(index: &DashMap<K, HashSet<String>>, key: K, id: &str) {
    index.entry(key).or_default().insert(id.to_string());
}

fn index_remove<K: Eq + Hash>(index: &DashMap<K, HashSet<String>>, key: &K, id: &str) {
    if let Some(mut ids) = index.get_mut(key) {
        ids.remove(id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}

impl ConnectionPool {
    pub fn new(retry: Arc<RetryManager>, idle_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_session: DashMap::new(),
            retry,
            idle_timeout,
        }
    }

    /// Add `conn`, replacing any connection registered under the same id.
    ///
    /// Registering the same connection twice is a no-op. A replaced
    /// connection is unindexed and its retries are abandoned.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let id = conn.id().to_string();
        let previous = self.connections.insert(id.clone(), Arc::clone(&conn));

        if let Some(old) = &previous {
            if Arc::ptr_eq(old, &conn) {
                return None;
            }
            self.unindex(old);
            self.retry.cancel_connection(&id);
            old.clear_pending();
        }

        index_add(&self.by_user, conn.user_id().to_string(), &id);
        if let Some(session_id) = conn.session_id() {
            index_add(&self.by_session, session_id, &id);
        }
        debug!(connection_id = %id, user_id = %conn.user_id(), "Connection registered");
        previous
    }

    /// Remove a connection and abandon its pending retries.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(connection_id)?;
        self.unindex(&conn);
        let abandoned = self.retry.cancel_connection(connection_id);
        conn.clear_pending();
        debug!(
            connection_id = %connection_id,
            user_id = %conn.user_id(),
            abandoned,
            "Connection unregistered"
        );
        Some(conn)
    }

    fn unindex(&self, conn: &Connection) {
        index_remove(&self.by_user, &conn.user_id().to_string(), conn.id());
        if let Some(session_id) = conn.session_id() {
            index_remove(&self.by_session, &session_id, conn.id());
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(&c))
    }

    fn resolve(&self, ids: Vec<String>, keep: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        ids.into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|c| keep(c))
            .collect()
    }

    /// Every live connection of a user.
    pub fn by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        self.resolve(ids, |c| c.user_id() == user_id)
    }

    /// Every live connection joined to a session.
    pub fn by_session(&self, session_id: &Uuid) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = self
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        self.resolve(ids, |c| c.session_id() == Some(*session_id))
    }

    /// Move a connection to `session_id` (or out of any session).
    ///
    /// Returns `false` if the connection is not registered.
    pub fn bind_session(&self, connection_id: &str, session_id: Option<Uuid>) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };
        let previous = conn.set_session(session_id);
        if previous == session_id {
            return true;
        }
        if let Some(old) = previous {
            index_remove(&self.by_session, &old, connection_id);
        }
        if let Some(new) = session_id {
            index_add(&self.by_session, new, connection_id);
            debug!(connection_id = %connection_id, session_id = %new, "Connection joined session");
        }
        true
    }

    /// Remove connections idle past the timeout or whose writer has gone.
    ///
    /// Returns the ids that were removed.
    pub fn sweep(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.is_closed() || c.idle_for() > self.idle_timeout)
            .map(|c| c.key().clone())
            .collect();

        for id in &stale {
            self.unregister(id);
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), remaining = self.connections.len(), "Swept stale connections");
        }
        stale
    }

    /// Sweep on `interval` until cancelled, pruning idle rate-limit
    /// windows on the same tick.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        rate_limiter: Option<Arc<RateLimiter>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                    if let Some(limiter) = &rate_limiter {
                        limiter.prune();
                    }
                }
            }
        }
        debug!("Connection sweeper stopped");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    /// Snapshot of every registered connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.connection_count(),
            users: self.user_count(),
            sessions: self.session_count(),
            pending_acks: self.retry.pending_count(),
        }
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry
    }
}
