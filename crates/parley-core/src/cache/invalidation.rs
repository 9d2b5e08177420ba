//! Asynchronous cache invalidation.
//!
//! Keys derived from many records (a user's session list, search pages)
//! are invalidated through a bounded queue drained by a background worker,
//! so writers never wait on them. Each event is retried a bounded number of
//! times; overflow drops the oldest event. The staleness window is whatever
//! lag the worker observes, reported through [`InvalidationStats`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_types::config::InvalidationConfig;
use parley_types::error::CacheError;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::backend::CacheBackend;
use super::keys;

/// Pause after a batch that had failures, so a down backend is not hammered.
const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// What an invalidation event clears.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationTarget {
    Session { session_id: Uuid },
    UserSessions { user_id: String },
    SessionMessages { session_id: Uuid },
}

impl InvalidationTarget {
    async fn apply<C: CacheBackend>(&self, backend: &C) -> Result<(), CacheError> {
        match self {
            InvalidationTarget::Session { session_id } => {
                backend.delete(&keys::session(session_id)).await?;
            }
            InvalidationTarget::UserSessions { user_id } => {
                backend.delete(&keys::user_sessions(user_id)).await?;
            }
            InvalidationTarget::SessionMessages { session_id } => {
                backend.delete(&keys::session_messages(session_id)).await?;
                backend.delete_prefix(&keys::search_prefix(session_id)).await?;
            }
        }
        Ok(())
    }
}

struct QueuedEvent {
    target: InvalidationTarget,
    enqueued_at: Instant,
    attempts: u32,
}

/// Queue plus the set of targets it holds, so duplicates coalesce.
#[derive(Default)]
struct QueueState {
    events: VecDeque<QueuedEvent>,
    queued: HashSet<InvalidationTarget>,
}

#[derive(Default)]
struct LagStats {
    max: Duration,
    total: Duration,
    count: u64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationStats {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub enqueued: u64,
    pub coalesced: u64,
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
    pub batches: u64,
    pub max_lag_ms: u64,
    pub avg_lag_ms: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_full_drain_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyStatus {
    /// Nothing queued and nothing lost.
    Consistent,
    /// Events are queued but none have been lost.
    Draining,
    /// Events were dropped or exhausted their retries; some entries may be
    /// stale until their TTL expires.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub generated_at: DateTime<Utc>,
    pub status: ConsistencyStatus,
    /// Worst observed delay between enqueue and successful invalidation.
    pub staleness_window_ms: u64,
    pub stats: InvalidationStats,
    pub issues: Vec<String>,
}

/// Bounded invalidation queue with a batch-draining worker.
pub struct CacheInvalidationService<C: CacheBackend> {
    backend: Arc<C>,
    config: InvalidationConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    lag: Mutex<LagStats>,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
    last_full_drain_at: Mutex<Option<DateTime<Utc>>>,
}

impl<C: CacheBackend> CacheInvalidationService<C> {
    pub fn new(backend: Arc<C>, config: InvalidationConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            lag: Mutex::new(LagStats::default()),
            last_processed_at: Mutex::new(None),
            last_full_drain_at: Mutex::new(None),
        }
    }

    pub fn invalidate_session(&self, session_id: Uuid) {
        self.enqueue(InvalidationTarget::Session { session_id });
    }

    pub fn invalidate_user_sessions(&self, user_id: &str) {
        self.enqueue(InvalidationTarget::UserSessions {
            user_id: user_id.to_string(),
        });
    }

    pub fn invalidate_session_messages(&self, session_id: Uuid) {
        self.enqueue(InvalidationTarget::SessionMessages { session_id });
    }

    /// Queue an event. Returns `false` if an identical event was already
    /// queued (the two are coalesced).
    pub fn enqueue(&self, target: InvalidationTarget) -> bool {
        {
            let mut state = self.state.lock();
            if state.queued.contains(&target) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if state.events.len() >= self.config.queue_capacity.max(1) {
                if let Some(oldest) = state.events.pop_front() {
                    state.queued.remove(&oldest.target);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event = ?oldest.target, "Invalidation queue full, dropped oldest event");
                }
            }
            state.queued.insert(target.clone());
            state.events.push_back(QueuedEvent {
                target,
                enqueued_at: Instant::now(),
                attempts: 0,
            });
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Process up to `batch_size` queued events. Returns how many succeeded.
    ///
    /// Failed events go back to the end of the queue until they have been
    /// attempted `max_attempts` times, after which they are counted as failed.
    pub async fn process_batch(&self) -> usize {
        let batch: Vec<QueuedEvent> = {
            let mut state = self.state.lock();
            let n = self.config.batch_size.max(1).min(state.events.len());
            let batch: Vec<QueuedEvent> = state.events.drain(..n).collect();
            for event in &batch {
                state.queued.remove(&event.target);
            }
            batch
        };
        if batch.is_empty() {
            return 0;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);

        let mut succeeded = 0;
        for mut event in batch {
            event.attempts += 1;
            match event.target.apply(self.backend.as_ref()).await {
                Ok(()) => {
                    succeeded += 1;
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.record_lag(event.enqueued_at.elapsed());
                }
                Err(e) if event.attempts < self.config.max_attempts => {
                    debug!(event = ?event.target, attempt = event.attempts, error = %e, "Invalidation failed, requeueing");
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    self.requeue(event);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(event = ?event.target, attempts = event.attempts, error = %e, "Invalidation gave up");
                }
            }
        }

        *self.last_processed_at.lock() = Some(Utc::now());
        if self.queue_depth() == 0 {
            *self.last_full_drain_at.lock() = Some(Utc::now());
        }
        succeeded
    }

    fn requeue(&self, event: QueuedEvent) {
        let mut state = self.state.lock();
        // A fresh event for the same target supersedes the retry.
        if state.queued.insert(event.target.clone()) {
            state.events.push_back(event);
        }
    }

    fn record_lag(&self, lag: Duration) {
        let mut stats = self.lag.lock();
        stats.max = stats.max.max(lag);
        stats.total += lag;
        stats.count += 1;
    }

    /// Process batches until the queue is empty.
    pub async fn drain(&self) {
        loop {
            let before = self.failed.load(Ordering::Relaxed) + self.retried.load(Ordering::Relaxed);
            self.process_batch().await;
            if self.queue_depth() == 0 {
                break;
            }
            let after = self.failed.load(Ordering::Relaxed) + self.retried.load(Ordering::Relaxed);
            if after > before {
                tokio::time::sleep(FAILURE_BACKOFF).await;
            }
        }
    }

    /// Worker loop: drain whenever events arrive, until cancelled.
    ///
    /// On cancellation the queue is drained once more before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("Cache invalidation worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => self.drain().await,
            }
        }
        self.drain().await;
        debug!("Cache invalidation worker stopped");
    }

    pub fn stats(&self) -> InvalidationStats {
        let lag = self.lag.lock();
        let avg = if lag.count == 0 {
            Duration::ZERO
        } else {
            lag.total / u32::try_from(lag.count).unwrap_or(u32::MAX)
        };
        InvalidationStats {
            queue_depth: self.queue_depth(),
            queue_capacity: self.config.queue_capacity,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            max_lag_ms: millis(lag.max),
            avg_lag_ms: millis(avg),
            last_processed_at: *self.last_processed_at.lock(),
            last_full_drain_at: *self.last_full_drain_at.lock(),
        }
    }

    pub fn consistency_report(&self) -> ConsistencyReport {
        let stats = self.stats();
        let mut issues = Vec::new();

        if stats.dropped > 0 {
            issues.push(format!(
                "{} invalidation events dropped on queue overflow",
                stats.dropped
            ));
        }
        if stats.failed > 0 {
            issues.push(format!(
                "{} invalidation events failed after {} attempts",
                stats.failed, self.config.max_attempts
            ));
        }
        if stats.queue_depth * 10 >= stats.queue_capacity * 8 {
            issues.push(format!(
                "queue at {}/{} capacity",
                stats.queue_depth, stats.queue_capacity
            ));
        }

        let status = if stats.dropped > 0 || stats.failed > 0 {
            ConsistencyStatus::Degraded
        } else if stats.queue_depth > 0 {
            ConsistencyStatus::Draining
        } else {
            ConsistencyStatus::Consistent
        };

        ConsistencyReport {
            generated_at: Utc::now(),
            status,
            staleness_window_ms: stats.max_lag_ms,
            stats,
            issues,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheBackend;
    use crate::testutil::ToggleCacheBackend;

    fn config(capacity: usize, batch: usize) -> InvalidationConfig {
        InvalidationConfig {
            queue_capacity: capacity,
            batch_size: batch,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_drain_deletes_derived_keys() {
        let backend = Arc::new(MemoryCacheBackend::new(100));
        let session_id = Uuid::now_v7();
        let ttl = Duration::from_secs(60);
        backend.set(&keys::user_sessions("u1"), "[]".into(), ttl).await.unwrap();
        backend.set(&keys::search(&session_id, "q", 10), "[]".into(), ttl).await.unwrap();
        backend.set(&keys::session_messages(&session_id), "[]".into(), ttl).await.unwrap();

        let service = CacheInvalidationService::new(backend.clone(), config(100, 10));
        service.invalidate_user_sessions("u1");
        service.invalidate_session_messages(session_id);
        service.drain().await;

        assert!(backend.is_empty());
        let stats = service.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.queue_depth, 0);
        assert!(stats.last_full_drain_at.is_some());
        assert_eq!(service.consistency_report().status, ConsistencyStatus::Consistent);
    }

    #[tokio::test]
    async fn test_duplicate_events_coalesce() {
        let backend = Arc::new(MemoryCacheBackend::new(10));
        let service = CacheInvalidationService::new(backend, config(100, 10));
        assert!(service.enqueue(InvalidationTarget::UserSessions { user_id: "u".into() }));
        assert!(!service.enqueue(InvalidationTarget::UserSessions { user_id: "u".into() }));
        assert_eq!(service.queue_depth(), 1);
        assert_eq!(service.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let backend = Arc::new(MemoryCacheBackend::new(10));
        let service = CacheInvalidationService::new(backend, config(2, 10));
        service.invalidate_user_sessions("a");
        service.invalidate_user_sessions("b");
        service.invalidate_user_sessions("c");

        assert_eq!(service.queue_depth(), 2);
        // "a" was dropped, so re-enqueueing it is not coalesced.
        assert!(service.enqueue(InvalidationTarget::UserSessions { user_id: "a".into() }));
        let report = service.consistency_report();
        assert_eq!(report.stats.dropped, 2);
        assert_eq!(report.status, ConsistencyStatus::Degraded);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let backend = Arc::new(MemoryCacheBackend::new(10));
        let service = CacheInvalidationService::new(backend, config(100, 2));
        for i in 0..5 {
            service.invalidate_user_sessions(&format!("user-{i}"));
        }
        assert_eq!(service.process_batch().await, 2);
        assert_eq!(service.queue_depth(), 3);
        assert_eq!(service.consistency_report().status, ConsistencyStatus::Draining);
        service.drain().await;
        assert_eq!(service.stats().batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_backend_exhausts_retries() {
        let backend = Arc::new(ToggleCacheBackend::new());
        backend.fail_deletes(true);
        let service = CacheInvalidationService::new(backend.clone(), config(100, 10));
        service.invalidate_session(Uuid::now_v7());
        service.drain().await;

        let stats = service.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
        assert_eq!(service.consistency_report().status, ConsistencyStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_retry() {
        let backend = Arc::new(ToggleCacheBackend::new());
        backend.fail_deletes(true);
        let service = CacheInvalidationService::new(backend.clone(), config(100, 10));
        service.invalidate_user_sessions("u");

        service.process_batch().await;
        assert_eq!(service.queue_depth(), 1);
        backend.fail_deletes(false);
        service.drain().await;

        let stats = service.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_processes_and_stops_on_cancel() {
        let backend = Arc::new(MemoryCacheBackend::new(10));
        backend
            .set(&keys::user_sessions("u"), "[]".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let service = Arc::new(CacheInvalidationService::new(backend.clone(), config(100, 10)));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(service.clone().run(cancel.clone()));

        service.invalidate_user_sessions("u");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.is_empty());

        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(service.stats().processed, 1);
    }
}
