//! Template-driven chat backend.
//!
//! Stands in for the consulting service's reply generator: every user
//! message gets an acknowledgment built from a configurable template.

use parley_core::chat::{ChatBackend, ChatReply};
use parley_types::config::BackendConfig;
use parley_types::error::ChatError;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

const CONTENT_PLACEHOLDER: &str = "{content}";

/// Replies with `template`, substituting `{content}` with the user's text.
#[derive(Debug, Clone)]
pub struct CannedReplyBackend {
    template: String,
}

impl CannedReplyBackend {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.reply_template.clone())
    }

    fn render(&self, content: &str) -> String {
        self.template.replace(CONTENT_PLACEHOLDER, content.trim())
    }
}

impl Default for CannedReplyBackend {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

impl ChatBackend for CannedReplyBackend {
    async fn send_message(&self, session_id: &Uuid, content: &str) -> Result<ChatReply, ChatError> {
        if self.template.trim().is_empty() {
            return Err(ChatError::Backend("reply template is empty".to_string()));
        }
        debug!(session_id = %session_id, chars = content.chars().count(), "Rendering canned reply");
        Ok(ChatReply {
            content: self.render(content),
            metadata: Some(json!({ "generator": "canned" })),
        })
    }
}
