//! SessionRepository trait definition.

use chrono::{DateTime, Utc};
use parley_types::chat::{ChatSession, SessionFilter, SessionStatus};
use parley_types::error::RepositoryError;
use uuid::Uuid;

/// Persistence for chat sessions.
///
/// Implementations live in parley-infra (e.g., `SqliteChatRepository`) and
/// in the cache layer (`CachedSessionRepository`, which wraps another
/// implementation). Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait SessionRepository: Send + Sync {
    /// Insert a new session.
    fn create(
        &self,
        session: &ChatSession,
    ) -> impl std::future::Future<Output = Result<ChatSession, RepositoryError>> + Send;

    /// Get a session by its unique ID.
    fn get_by_id(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChatSession>, RepositoryError>> + Send;

    /// Replace every mutable column of an existing session.
    ///
    /// Returns `RepositoryError::NotFound` if the session does not exist.
    fn update(
        &self,
        session: &ChatSession,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set the lifecycle status (and `updated_at`).
    fn update_status(
        &self,
        id: &Uuid,
        status: SessionStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record activity at `at` (sets `last_activity_at` and `updated_at`).
    fn update_activity(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All sessions owned by a user, most recently active first.
    fn list_by_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ChatSession>, RepositoryError>> + Send;

    /// Sessions matching a filter, most recently active first.
    fn list(
        &self,
        filter: &SessionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ChatSession>, RepositoryError>> + Send;
}
