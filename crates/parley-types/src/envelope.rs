//! Wire envelopes exchanged over a realtime connection.
//!
//! Inbound frames arrive as a flat JSON object with a `type` discriminant and
//! optional fields. [`InboundEnvelope`] is the lenient wire shape; it is
//! validated into the closed [`Inbound`] enum before dispatch so every
//! message kind is handled exhaustively.
//!
//! Outbound frames are either an [`OutboundEnvelope`] (message responses and
//! errors) or a tagged [`ServerEvent`] (typing, presence, heartbeat acks).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ChatMessage, MessageType};
use crate::error::ChatError;

/// The closed set of inbound message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Message,
    Typing,
    Presence,
    Heartbeat,
    Ack,
}

impl InboundKind {
    /// Every kind, in dispatch-table order.
    pub const ALL: [InboundKind; 5] = [
        InboundKind::Message,
        InboundKind::Typing,
        InboundKind::Presence,
        InboundKind::Heartbeat,
        InboundKind::Ack,
    ];

    /// Whether frames of this kind count against the sender's rate limit.
    pub fn is_rate_limited(self) -> bool {
        matches!(self, InboundKind::Message)
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundKind::Message => write!(f, "message"),
            InboundKind::Typing => write!(f, "typing"),
            InboundKind::Presence => write!(f, "presence"),
            InboundKind::Heartbeat => write!(f, "heartbeat"),
            InboundKind::Ack => write!(f, "ack"),
        }
    }
}

impl FromStr for InboundKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(InboundKind::Message),
            "typing" => Ok(InboundKind::Typing),
            "presence" => Ok(InboundKind::Presence),
            "heartbeat" => Ok(InboundKind::Heartbeat),
            "ack" => Ok(InboundKind::Ack),
            other => Err(format!("unknown envelope type '{other}'")),
        }
    }
}

/// Raw inbound frame as sent by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Client presence states carried by `presence` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(format!("invalid presence status '{other}'")),
        }
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Chat content for a new or existing session.
    Message {
        session_id: Option<Uuid>,
        content: String,
        metadata: Option<serde_json::Value>,
    },
    /// The sender started or stopped typing.
    Typing { session_id: Option<Uuid>, is_typing: bool },
    /// The sender's presence changed.
    Presence { status: PresenceStatus },
    /// Liveness ping.
    Heartbeat,
    /// Delivery confirmation for a broadcast message.
    Ack { message_id: Uuid },
}

impl Inbound {
    /// Parse and validate a raw JSON text frame.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let envelope: InboundEnvelope = serde_json::from_str(raw)
            .map_err(|e| ChatError::validation(format!("malformed envelope: {e}")))?;
        Inbound::try_from(envelope)
    }

    /// The discriminant of this frame.
    pub fn kind(&self) -> InboundKind {
        match self {
            Inbound::Message { .. } => InboundKind::Message,
            Inbound::Typing { .. } => InboundKind::Typing,
            Inbound::Presence { .. } => InboundKind::Presence,
            Inbound::Heartbeat => InboundKind::Heartbeat,
            Inbound::Ack { .. } => InboundKind::Ack,
        }
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ChatError> {
    Uuid::parse_str(value).map_err(|_| ChatError::validation(format!("{field} is not a valid id")))
}

fn optional_uuid(field: &str, value: Option<&str>) -> Result<Option<Uuid>, ChatError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => parse_uuid(field, v).map(Some),
    }
}

impl TryFrom<InboundEnvelope> for Inbound {
    type Error = ChatError;

    fn try_from(envelope: InboundEnvelope) -> Result<Self, Self::Error> {
        let kind: InboundKind = envelope.kind.parse().map_err(ChatError::Validation)?;

        match kind {
            InboundKind::Message => {
                let content = envelope
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ChatError::validation("message content is required"))?;
                if let Some(meta) = &envelope.metadata {
                    if !meta.is_object() {
                        return Err(ChatError::validation("metadata must be a JSON object"));
                    }
                }
                Ok(Inbound::Message {
                    session_id: optional_uuid("session_id", envelope.session_id.as_deref())?,
                    content,
                    metadata: envelope.metadata,
                })
            }
            InboundKind::Typing => {
                let is_typing = envelope
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("is_typing"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                Ok(Inbound::Typing {
                    session_id: optional_uuid("session_id", envelope.session_id.as_deref())?,
                    is_typing,
                })
            }
            InboundKind::Presence => {
                let status = match envelope.content.as_deref() {
                    None | Some("") => PresenceStatus::Online,
                    Some(s) => s.parse().map_err(ChatError::Validation)?,
                };
                Ok(Inbound::Presence { status })
            }
            InboundKind::Heartbeat => Ok(Inbound::Heartbeat),
            InboundKind::Ack => {
                let raw = envelope
                    .message_id
                    .ok_or_else(|| ChatError::validation("ack requires message_id"))?;
                Ok(Inbound::Ack {
                    message_id: parse_uuid("message_id", raw.trim())?,
                })
            }
        }
    }
}

/// Message body of an outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
}

impl From<&ChatMessage> for OutboundMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            message_type: message.message_type,
            content: message.content.clone(),
            timestamp: message.created_at,
            session_id: message.session_id,
        }
    }
}

/// Response frame for chat messages and errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub success: bool,
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<OutboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl OutboundEnvelope {
    /// A successful response carrying `message`.
    pub fn success(message: &ChatMessage, metadata: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            session_id: Some(message.session_id),
            message: Some(OutboundMessage::from(message)),
            error: None,
            metadata,
        }
    }

    /// An error response; the error code is carried in `metadata.code`.
    pub fn failure(session_id: Option<Uuid>, error: &ChatError) -> Self {
        Self {
            success: false,
            session_id,
            message: None,
            error: Some(error.to_string()),
            metadata: Some(serde_json::json!({ "code": error.code() })),
        }
    }

    /// Id of the carried message, if any (used for ack tracking).
    pub fn message_id(&self) -> Option<Uuid> {
        self.message.as_ref().map(|m| m.id)
    }
}

/// Transient server-originated events. Never persisted, never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Typing {
        session_id: Uuid,
        user_id: String,
        is_typing: bool,
        timestamp: DateTime<Utc>,
    },
    Presence {
        user_id: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
}
