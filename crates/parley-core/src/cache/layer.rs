//! Shared read-through plumbing for the cached repositories.
//!
//! Two mechanisms keep the cache from serving data older than the store:
//!
//! - A per-key version counter, tracked only while a read-through on the
//!   key is in flight. A reader takes a [`ReadTicket`] before loading from
//!   the store; writers bump the counter after the durable write and before
//!   deleting the key; the reader skips (or undoes) its populate if the
//!   version moved. The entry is dropped with the last ticket.
//! - A dirty set. A key whose delete failed is marked dirty and bypassed by
//!   reads until a later delete succeeds.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parley_types::config::CacheConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::warn;

use super::backend::CacheBackend;
use super::invalidation::{CacheInvalidationService, InvalidationTarget};
use super::monitor::{CacheMonitor, CacheOpKind};

#[derive(Debug, Default)]
struct KeyVersion {
    version: u64,
    readers: usize,
}

/// An in-flight read-through on one guard key.
///
/// Remembers the guard's version at the start of the read. Dropping the
/// last ticket on a key forgets its version.
pub struct ReadTicket<'a> {
    versions: &'a DashMap<String, KeyVersion>,
    guard: String,
    version: u64,
}

impl Drop for ReadTicket<'_> {
    fn drop(&mut self) {
        let guard = std::mem::take(&mut self.guard);
        if let Entry::Occupied(mut entry) = self.versions.entry(guard) {
            let state = entry.get_mut();
            state.readers = state.readers.saturating_sub(1);
            if state.readers == 0 {
                entry.remove();
            }
        }
    }
}

/// Cache state shared by the session and message decorators.
pub struct CacheLayer<C: CacheBackend> {
    backend: Arc<C>,
    monitor: Arc<CacheMonitor>,
    invalidation: Arc<CacheInvalidationService<C>>,
    config: CacheConfig,
    versions: DashMap<String, KeyVersion>,
    dirty: DashSet<String>,
}

impl<C: CacheBackend> CacheLayer<C> {
    pub fn new(
        backend: Arc<C>,
        monitor: Arc<CacheMonitor>,
        invalidation: Arc<CacheInvalidationService<C>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            monitor,
            invalidation,
            config,
            versions: DashMap::new(),
            dirty: DashSet::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<CacheMonitor> {
        &self.monitor
    }

    pub fn invalidation(&self) -> &Arc<CacheInvalidationService<C>> {
        &self.invalidation
    }

    pub fn backend(&self) -> &Arc<C> {
        &self.backend
    }

    /// Start a read-through guarded by `guard`. Hold the ticket until the
    /// populate that follows the store load has finished.
    pub fn begin_read(&self, guard: &str) -> ReadTicket<'_> {
        let version = {
            let mut state = self.versions.entry(guard.to_string()).or_default();
            state.readers += 1;
            state.version
        };
        ReadTicket {
            versions: &self.versions,
            guard: guard.to_string(),
            version,
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).map_or(0, |state| state.version)
    }

    /// Keys with a read-through in flight.
    pub fn tracked_keys(&self) -> usize {
        self.versions.len()
    }

    // Without a reader in flight nobody holds an older version to compare.
    fn bump(&self, key: &str) {
        if let Some(mut state) = self.versions.get_mut(key) {
            state.version += 1;
        }
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.contains(key)
    }

    /// Number of keys currently bypassed because a delete failed.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Read and decode `key`.
    ///
    /// Returns `None` on a miss, when caching is disabled, when the key is
    /// dirty, or on any backend or decode error. Errors never escape.
    pub async fn read<T: DeserializeOwned>(&self, kind: CacheOpKind, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let started = Instant::now();

        if self.is_dirty(key) {
            self.retry_dirty(key).await;
            self.monitor.record_miss(kind, started.elapsed());
            return None;
        }

        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.monitor.record_hit(kind, started.elapsed());
                    Some(value)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    self.monitor.record_error(kind);
                    if self.backend.delete(key).await.is_err() {
                        self.dirty.insert(key.to_string());
                    }
                    None
                }
            },
            Ok(None) => {
                self.monitor.record_miss(kind, started.elapsed());
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to store");
                self.monitor.record_error(kind);
                None
            }
        }
    }

    /// Store `value` under `key`, unless a write raced the load.
    ///
    /// `ticket` must have been taken before the store read that produced
    /// `value`. Its guard is usually `key` itself; key families invalidated
    /// by prefix use the prefix.
    pub async fn populate<T: Serialize>(
        &self,
        kind: CacheOpKind,
        key: &str,
        value: &T,
        ttl: Duration,
        ticket: &ReadTicket<'_>,
    ) {
        let raced = || self.version(&ticket.guard) != ticket.version;
        if !self.config.enabled || self.is_dirty(key) || raced() {
            return;
        }
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                self.monitor.record_error(kind);
                return;
            }
        };

        let started = Instant::now();
        match self.backend.set(key, raw, ttl).await {
            Ok(()) => self.monitor.record_set(kind, started.elapsed()),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed");
                self.monitor.record_error(kind);
                return;
            }
        }

        if raced() {
            self.delete_or_mark(key).await;
        }
    }

    /// Invalidate `key` after a durable write.
    pub async fn invalidate(&self, key: &str) {
        self.bump(key);
        if !self.config.enabled {
            return;
        }
        let started = Instant::now();
        if self.delete_or_mark(key).await {
            self.monitor
                .record_set(CacheOpKind::Invalidate, started.elapsed());
        }
    }

    /// Bump `guard` now and leave the deletes to the invalidation worker.
    ///
    /// Readers that loaded before the bump will not populate, so the only
    /// stale entries are those already cached, until the worker gets to them.
    pub fn invalidate_deferred(&self, guard: &str, target: InvalidationTarget) {
        self.bump(guard);
        if self.config.enabled {
            self.invalidation.enqueue(target);
        }
    }

    async fn delete_or_mark(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(_) => {
                self.dirty.remove(key);
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache delete failed, bypassing key until it succeeds");
                self.monitor.record_error(CacheOpKind::Invalidate);
                self.dirty.insert(key.to_string());
                false
            }
        }
    }

    async fn retry_dirty(&self, key: &str) {
        if self.backend.delete(key).await.is_ok() {
            self.dirty.remove(key);
        }
    }
}
