//! Read-through cache for sessions and messages.
//!
//! `CachedSessionRepository` and `CachedMessageRepository` decorate any
//! repository implementation and share one [`CacheLayer`]: the backend, the
//! [`CacheMonitor`], the [`CacheInvalidationService`] queue, and the
//! consistency bookkeeping. A cache outage degrades to store reads; it is
//! never surfaced to callers.

pub mod backend;
pub mod invalidation;
pub mod keys;
pub mod layer;
pub mod memory;
pub mod message;
pub mod monitor;
pub mod session;

pub use backend::CacheBackend;
pub use invalidation::{
    CacheInvalidationService, ConsistencyReport, ConsistencyStatus, InvalidationStats,
    InvalidationTarget,
};
pub use layer::CacheLayer;
pub use memory::MemoryCacheBackend;
pub use message::CachedMessageRepository;
pub use monitor::{CacheHealth, CacheMetrics, CacheMonitor, CacheOpKind, HealthLevel, PerformanceReport};
pub use session::CachedSessionRepository;
