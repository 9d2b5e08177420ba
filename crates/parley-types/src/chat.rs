//! Chat session and message types for Parley.
//!
//! These types model intake conversations between a client and the chat
//! service: sessions with a lifecycle status, and the messages within them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time truncated to microseconds.
///
/// Stored timestamps are microsecond precision, so values minted in memory
/// are truncated to survive a store round trip unchanged.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle status of a chat session.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('active', 'inactive', 'expired', 'terminated'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Expired,
    Terminated,
}

impl SessionStatus {
    /// Expired and terminated sessions never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Terminated)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Active, Inactive) | (Active, Expired) | (Active, Terminated) => true,
            (Inactive, Active) | (Inactive, Expired) | (Inactive, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Inactive => write!(f, "inactive"),
            SessionStatus::Expired => write!(f, "expired"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "inactive" => Ok(SessionStatus::Inactive),
            "expired" => Ok(SessionStatus::Expired),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Active
    }
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::User => write!(f, "user"),
            MessageType::Assistant => write!(f, "assistant"),
            MessageType::System => write!(f, "system"),
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageType::User),
            "assistant" => Ok(MessageType::Assistant),
            "system" => Ok(MessageType::System),
            other => Err(format!("invalid message type: '{other}'")),
        }
    }
}

/// Delivery status of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Read => write!(f, "read"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("invalid message status: '{other}'")),
        }
    }
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Sent
    }
}

/// A conversation between one user and the chat service.
///
/// Sessions outlive individual connections: a client may reconnect and keep
/// writing into the same session until it expires or is terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: String,
    pub client_name: String,
    pub context: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChatSession {
    /// Build a fresh active session that expires after `ttl`.
    pub fn new(user_id: impl Into<String>, client_name: impl Into<String>, ttl: Duration) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            client_name: client_name.into(),
            context: String::new(),
            status: SessionStatus::Active,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether `expires_at` has passed at `now`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the session can still accept new messages.
    pub fn accepts_messages(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A single message within a chat session.
///
/// Messages are totally ordered within a session by `(created_at, id)`;
/// ids are UUID v7 so the tiebreak follows creation order as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ChatMessage {
    /// Build a new message in `Sent` status stamped with the current time.
    pub fn new(session_id: Uuid, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id,
            message_type,
            content: content.into(),
            metadata: empty_metadata(),
            status: MessageStatus::Sent,
            created_at: now_micros(),
        }
    }

    /// Attach metadata (replaces any existing value).
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sort messages into their canonical session order, oldest first.
pub fn sort_chronologically(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Filters for listing messages across sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub session_id: Option<Uuid>,
    pub message_type: Option<MessageType>,
    pub status: Option<MessageStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl MessageFilter {
    /// Whether `message` satisfies every populated criterion (ignores paging).
    pub fn matches(&self, message: &ChatMessage) -> bool {
        self.session_id.is_none_or(|id| message.session_id == id)
            && self.message_type.is_none_or(|t| message.message_type == t)
            && self.status.is_none_or(|s| message.status == s)
            && self.since.is_none_or(|t| message.created_at >= t)
            && self.until.is_none_or(|t| message.created_at < t)
    }
}

/// Filters for listing sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
    /// Only sessions whose last activity is older than this instant.
    pub idle_before: Option<DateTime<Utc>>,
    /// Only sessions whose `expires_at` is at or before this instant.
    pub expires_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SessionFilter {
    /// Whether `session` satisfies every populated criterion (ignores paging).
    pub fn matches(&self, session: &ChatSession) -> bool {
        self.user_id.as_deref().is_none_or(|u| session.user_id == u)
            && self.status.is_none_or(|s| session.status == s)
            && self.idle_before.is_none_or(|t| session.last_activity_at < t)
            && self.expires_before.is_none_or(|t| session.expires_at <= t)
    }
}
