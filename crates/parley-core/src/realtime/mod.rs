pub mod broadcast;
pub mod connection;
pub mod failure;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod router;

pub use broadcast::{BroadcastReport, BroadcastTarget, Broadcaster};
pub use connection::{Connection, PendingAck};
pub use failure::record_delivery_failures;
pub use pool::{ConnectionPool, PoolStats};
pub use rate_limit::RateLimiter;
pub use retry::{DeliveryFailure, RetryManager, RetryStats};
pub use router::MessageRouter;
