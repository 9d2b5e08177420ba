//! Cache backend trait.
//!
//! Values are opaque JSON strings; the cache layer owns (de)serialization.
//! Every operation is fallible so a remote backend can report outages; the
//! cache layer absorbs those errors and falls back to the store.

use std::time::Duration;

use parley_types::error::CacheError;

/// Trait for a TTL key-value cache.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition). The
/// in-process implementation is [`MemoryCacheBackend`](super::memory::MemoryCacheBackend).
pub trait CacheBackend: Send + Sync + 'static {
    /// Get a value by key. Expired entries read as `None`.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, CacheError>> + Send;

    /// Set a value with a time-to-live (upsert).
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Delete a key. Returns whether an entry was removed.
    fn delete(&self, key: &str)
    -> impl std::future::Future<Output = Result<bool, CacheError>> + Send;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<usize, CacheError>> + Send;
}
