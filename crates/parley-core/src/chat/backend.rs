//! ChatBackend trait: the collaborator that answers user messages.

use parley_types::error::ChatError;
use uuid::Uuid;

/// An assistant reply produced for one user message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
        }
    }
}

/// Produces the assistant side of a conversation.
///
/// Called by the message router after the user message has been persisted.
/// Errors surface to the sender as `BACKEND_ERROR`; the user message stays
/// stored.
pub trait ChatBackend: Send + Sync {
    fn send_message(
        &self,
        session_id: &Uuid,
        content: &str,
    ) -> impl std::future::Future<Output = Result<ChatReply, ChatError>> + Send;
}
