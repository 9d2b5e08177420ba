//! MessageRepository trait definition.

use parley_types::chat::{ChatMessage, MessageFilter, MessageStatus};
use parley_types::error::RepositoryError;
use uuid::Uuid;

/// Persistence for chat messages.
///
/// Every read that returns several messages returns them in canonical
/// session order: `(created_at, id)` ascending.
pub trait MessageRepository: Send + Sync {
    /// Insert a new message.
    fn create(
        &self,
        message: &ChatMessage,
    ) -> impl std::future::Future<Output = Result<ChatMessage, RepositoryError>> + Send;

    /// Replace the content, metadata and status of an existing message.
    ///
    /// Returns `RepositoryError::NotFound` if the message does not exist.
    fn update(
        &self,
        message: &ChatMessage,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a single message. `NotFound` if it does not exist.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a message by its unique ID.
    fn get_by_id(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChatMessage>, RepositoryError>> + Send;

    /// Page through a session's history from the newest end.
    ///
    /// `offset = 0` selects the `limit` most recent messages; larger offsets
    /// step back in time. The page itself is returned oldest first.
    fn get_by_session_id(
        &self,
        session_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Messages matching a filter, oldest first.
    fn list(
        &self,
        filter: &MessageFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Case-insensitive substring search within one session, oldest first.
    fn search(
        &self,
        session_id: &Uuid,
        query: &str,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Set a message's delivery status. `NotFound` if it does not exist.
    fn update_status(
        &self,
        id: &Uuid,
        status: MessageStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete every message in a session, returning how many were removed.
    fn delete_by_session_id(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Number of messages stored for a session.
    fn count_by_session(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
