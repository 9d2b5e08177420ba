//! Inbound envelope dispatch.
//!
//! Every text frame from a connection passes through [`MessageRouter`]. The
//! frame is validated into the closed [`Inbound`] enum and matched
//! exhaustively, so adding a kind is a compile error until it is handled
//! here. Errors become a failure envelope on the sending connection; the
//! connection itself is never closed by the router.

use std::sync::Arc;

use chrono::Utc;
use parley_types::chat::{ChatMessage, ChatSession, MessageType};
use parley_types::envelope::{Inbound, OutboundEnvelope, PresenceStatus, ServerEvent};
use parley_types::error::ChatError;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broadcast::{BroadcastTarget, Broadcaster};
use super::connection::Connection;
use super::pool::ConnectionPool;
use super::rate_limit::RateLimiter;
use crate::chat::backend::ChatBackend;
use crate::chat::session::SessionService;
use crate::repository::{MessageRepository, SessionRepository};

/// Routes validated envelopes to their handlers.
///
/// `M` is normally the cached message repository so that writes made here
/// invalidate the session's cached history before the reply is broadcast.
pub struct MessageRouter<S: SessionRepository, M: MessageRepository, B: ChatBackend> {
    sessions: Arc<SessionService<S>>,
    messages: Arc<M>,
    backend: Arc<B>,
    pool: Arc<ConnectionPool>,
    broadcaster: Arc<Broadcaster>,
    rate_limiter: Arc<RateLimiter>,
    max_content_len: usize,
}

impl<S, M, B> MessageRouter<S, M, B>
where
    S: SessionRepository,
    M: MessageRepository,
    B: ChatBackend,
{
    pub fn new(
        sessions: Arc<SessionService<S>>,
        messages: Arc<M>,
        backend: Arc<B>,
        pool: Arc<ConnectionPool>,
        broadcaster: Arc<Broadcaster>,
        rate_limiter: Arc<RateLimiter>,
        max_content_len: usize,
    ) -> Self {
        Self {
            sessions,
            messages,
            backend,
            pool,
            broadcaster,
            rate_limiter,
            max_content_len,
        }
    }

    /// Handle one raw text frame from `conn`.
    ///
    /// Any frame counts as activity, including ones that fail validation.
    pub async fn route_text(&self, conn: &Arc<Connection>, raw: &str) {
        conn.touch();
        match Inbound::parse(raw) {
            Ok(inbound) => {
                let session_hint = inbound_session(&inbound);
                if let Err(e) = self.route(conn, inbound).await {
                    self.reject(conn, session_hint.or_else(|| conn.session_id()), &e);
                }
            }
            Err(e) => self.reject(conn, conn.session_id(), &e),
        }
    }

    /// Dispatch a validated envelope.
    ///
    /// Only `message` envelopes count against the sender's rate limit.
    pub async fn route(&self, conn: &Arc<Connection>, inbound: Inbound) -> Result<(), ChatError> {
        let kind = inbound.kind();
        if kind.is_rate_limited() && !self.rate_limiter.allow(conn.user_id()) {
            return Err(ChatError::RateLimitExceeded {
                limit: self.rate_limiter.max_messages(),
                window_secs: self.rate_limiter.window().as_secs(),
            });
        }

        debug!(connection_id = %conn.id(), kind = %kind, "Routing envelope");
        match inbound {
            Inbound::Message {
                session_id,
                content,
                metadata,
            } => self.handle_message(conn, session_id, content, metadata).await,
            Inbound::Typing {
                session_id,
                is_typing,
            } => self.handle_typing(conn, session_id, is_typing).await,
            Inbound::Presence { status } => {
                self.handle_presence(conn, status);
                Ok(())
            }
            Inbound::Heartbeat => {
                self.handle_heartbeat(conn);
                Ok(())
            }
            Inbound::Ack { message_id } => {
                self.handle_ack(conn, &message_id);
                Ok(())
            }
        }
    }

    fn reject(&self, conn: &Connection, session_id: Option<Uuid>, err: &ChatError) {
        match err {
            ChatError::Validation(_) => {
                debug!(connection_id = %conn.id(), session_id = ?session_id, error = %err, "Rejected envelope")
            }
            ChatError::RateLimitExceeded { .. } => {
                warn!(connection_id = %conn.id(), user_id = %conn.user_id(), "Rate limit exceeded")
            }
            ChatError::Store(_) => {
                error!(connection_id = %conn.id(), session_id = ?session_id, error = %err, "Store failure while routing")
            }
            ChatError::Backend(_) | ChatError::Authentication(_) => {
                warn!(connection_id = %conn.id(), session_id = ?session_id, error = %err, "Routing failed")
            }
        }
        self.broadcaster
            .send_to(conn, &OutboundEnvelope::failure(session_id, err));
    }

    async fn handle_message(
        &self,
        conn: &Arc<Connection>,
        session_id: Option<Uuid>,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), ChatError> {
        if content.chars().count() > self.max_content_len {
            return Err(ChatError::validation(format!(
                "message content exceeds {} characters",
                self.max_content_len
            )));
        }

        let session = match session_id {
            Some(id) => self.sessions.resolve_for_user(&id, conn.user_id()).await?,
            None => {
                let client_name = metadata
                    .as_ref()
                    .and_then(|m| m.get("client_name"))
                    .and_then(serde_json::Value::as_str);
                self.sessions
                    .create_session(conn.user_id(), client_name, None)
                    .await?
            }
        };
        self.join(conn, &session);

        let mut user_message = ChatMessage::new(session.id, MessageType::User, content);
        if let Some(metadata) = metadata {
            user_message = user_message.with_metadata(metadata);
        }
        let user_message = self.messages.create(&user_message).await?;

        let reply = self
            .backend
            .send_message(&session.id, &user_message.content)
            .await?;
        let mut assistant = ChatMessage::new(session.id, MessageType::Assistant, reply.content);
        if let Some(metadata) = reply.metadata {
            assistant = assistant.with_metadata(metadata);
        }
        let assistant = self.messages.create(&assistant).await?;

        if let Err(e) = self.sessions.update_activity(&session.id).await {
            warn!(session_id = %session.id, error = %e, "Failed to record session activity");
        }

        let envelope = OutboundEnvelope::success(
            &assistant,
            Some(json!({ "user_message_id": user_message.id })),
        );
        let report = self
            .broadcaster
            .broadcast(&BroadcastTarget::Session(session.id), &envelope);
        info!(
            connection_id = %conn.id(),
            session_id = %session.id,
            message_id = %assistant.id,
            recipients = report.recipients,
            "Message handled"
        );
        Ok(())
    }

    fn join(&self, conn: &Connection, session: &ChatSession) {
        if !self.pool.bind_session(conn.id(), Some(session.id)) {
            warn!(
                connection_id = %conn.id(),
                session_id = %session.id,
                "Connection is not registered, replies will not reach it"
            );
        }
    }

    /// The session a transient event applies to, checked against the sender.
    async fn event_session(
        &self,
        conn: &Connection,
        requested: Option<Uuid>,
    ) -> Result<Uuid, ChatError> {
        let bound = conn.session_id();
        let id = requested
            .or(bound)
            .ok_or_else(|| ChatError::validation("typing requires a session_id"))?;
        if bound == Some(id) {
            return Ok(id);
        }

        let session = self
            .sessions
            .get_session(&id)
            .await?
            .filter(|s| s.user_id == conn.user_id() && s.accepts_messages())
            .ok_or_else(|| ChatError::validation(format!("unknown session {id}")))?;
        self.join(conn, &session);
        Ok(session.id)
    }

    async fn handle_typing(
        &self,
        conn: &Arc<Connection>,
        session_id: Option<Uuid>,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        let session_id = self.event_session(conn, session_id).await?;
        let event = ServerEvent::Typing {
            session_id,
            user_id: conn.user_id().to_string(),
            is_typing,
            timestamp: Utc::now(),
        };
        self.broadcaster.broadcast_event(
            &BroadcastTarget::Session(session_id),
            &event,
            Some(conn.id()),
        );
        Ok(())
    }

    fn handle_presence(&self, conn: &Connection, status: PresenceStatus) {
        let session_id = conn.session_id();
        let target = match session_id {
            Some(id) => BroadcastTarget::Session(id),
            None => BroadcastTarget::User(conn.user_id().to_string()),
        };
        let event = ServerEvent::Presence {
            user_id: conn.user_id().to_string(),
            status,
            session_id,
            timestamp: Utc::now(),
        };
        self.broadcaster
            .broadcast_event(&target, &event, Some(conn.id()));
    }

    fn handle_heartbeat(&self, conn: &Connection) {
        conn.touch();
        self.broadcaster.send_to(
            conn,
            &ServerEvent::HeartbeatAck {
                timestamp: Utc::now(),
            },
        );
    }

    fn handle_ack(&self, conn: &Connection, message_id: &Uuid) {
        if self.pool.retry_manager().on_ack(conn, message_id) {
            debug!(connection_id = %conn.id(), message_id = %message_id, "Message acknowledged");
        } else {
            debug!(connection_id = %conn.id(), message_id = %message_id, "Ack for unknown message ignored");
        }
    }
}

fn inbound_session(inbound: &Inbound) -> Option<Uuid> {
    match inbound {
        Inbound::Message { session_id, .. } | Inbound::Typing { session_id, .. } => *session_id,
        Inbound::Presence { .. } | Inbound::Heartbeat | Inbound::Ack { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::retry::RetryManager;
    use crate::testutil::{EchoBackend, InMemoryChatStore, connection, drain_frames};
    use parley_types::chat::{MessageStatus, SessionStatus};
    use parley_types::config::{DeliveryConfig, SessionConfig};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type TestRouter = MessageRouter<InMemoryChatStore, InMemoryChatStore, EchoBackend>;

    struct Fixture {
        router: TestRouter,
        store: Arc<InMemoryChatStore>,
        backend: Arc<EchoBackend>,
        pool: Arc<ConnectionPool>,
        retry: Arc<RetryManager>,
        limiter: Arc<RateLimiter>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryChatStore::new());
        let backend = Arc::new(EchoBackend::default());
        let (retry, _failures) = RetryManager::new(&DeliveryConfig::default());
        let retry = Arc::new(retry);
        let pool = Arc::new(ConnectionPool::new(retry.clone(), Duration::from_secs(300)));
        let broadcaster = Arc::new(Broadcaster::new(pool.clone(), retry.clone()));
        let limiter = Arc::new(RateLimiter::default());
        let sessions = Arc::new(SessionService::new(store.clone(), SessionConfig::default()));
        let router = MessageRouter::new(
            sessions,
            store.clone(),
            backend.clone(),
            pool.clone(),
            broadcaster,
            limiter.clone(),
            100,
        );
        Fixture {
            router,
            store,
            backend,
            pool,
            retry,
            limiter,
        }
    }

    impl Fixture {
        fn connect(&self, id: &str, user: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
            let (conn, rx) = connection(id, user);
            self.pool.register(conn.clone());
            (conn, rx)
        }
    }

    fn frame_session(frame: &serde_json::Value) -> Uuid {
        Uuid::parse_str(frame["session_id"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_message_without_session_creates_one() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");

        f.router
            .route_text(&conn, r#"{"type":"message","content":"Hello"}"#)
            .await;

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame["success"], true);
        assert_eq!(frame["message"]["type"], "assistant");
        assert_eq!(frame["message"]["content"], "echo: Hello");
        let session_id = frame_session(frame);
        assert_eq!(conn.session_id(), Some(session_id));

        let stored = f.store.messages_in(&session_id);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].message_type, MessageType::User);
        assert_eq!(stored[1].message_type, MessageType::Assistant);
        assert_eq!(frame["metadata"]["user_message_id"], stored[0].id.to_string());
        assert_eq!(f.retry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_message_continues_existing_session_and_reaches_members() {
        let f = fixture();
        let (first, mut rx1) = f.connect("c1", "alice");
        let (second, mut rx2) = f.connect("c2", "alice");

        f.router
            .route_text(&first, r#"{"type":"message","content":"one"}"#)
            .await;
        let session_id = frame_session(&drain_frames(&mut rx1)[0]);

        let raw = format!(r#"{{"type":"message","session_id":"{session_id}","content":"two"}}"#);
        f.router.route_text(&second, &raw).await;

        assert_eq!(second.session_id(), Some(session_id));
        assert_eq!(drain_frames(&mut rx1)[0]["message"]["content"], "echo: two");
        assert_eq!(drain_frames(&mut rx2)[0]["message"]["content"], "echo: two");
        assert_eq!(f.store.messages_in(&session_id).len(), 4);
    }

    #[tokio::test]
    async fn test_foreign_or_unknown_session_is_validation_error() {
        let f = fixture();
        let (alice, mut rx_a) = f.connect("a", "alice");
        let (bob, mut rx_b) = f.connect("b", "bob");

        f.router
            .route_text(&alice, r#"{"type":"message","content":"mine"}"#)
            .await;
        let session_id = frame_session(&drain_frames(&mut rx_a)[0]);

        let raw = format!(r#"{{"type":"message","session_id":"{session_id}","content":"hi"}}"#);
        f.router.route_text(&bob, &raw).await;
        let frame = &drain_frames(&mut rx_b)[0];
        assert_eq!(frame["success"], false);
        assert_eq!(frame["metadata"]["code"], "VALIDATION_ERROR");

        let raw = format!(r#"{{"type":"message","session_id":"{}","content":"hi"}}"#, Uuid::now_v7());
        f.router.route_text(&bob, &raw).await;
        assert_eq!(drain_frames(&mut rx_b)[0]["success"], false);
        assert_eq!(f.store.messages_in(&session_id).len(), 2);
        assert_eq!(bob.session_id(), None);
    }

    #[tokio::test]
    async fn test_terminated_session_rejects_messages() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        f.router
            .route_text(&conn, r#"{"type":"message","content":"one"}"#)
            .await;
        let session_id = frame_session(&drain_frames(&mut rx)[0]);
        f.store.set_session_status(&session_id, SessionStatus::Terminated);

        let raw = format!(r#"{{"type":"message","session_id":"{session_id}","content":"two"}}"#);
        f.router.route_text(&conn, &raw).await;
        let frame = &drain_frames(&mut rx)[0];
        assert_eq!(frame["success"], false);
        assert_eq!(frame_session(frame), session_id);
    }

    #[tokio::test]
    async fn test_sixty_first_message_is_rate_limited() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");

        for _ in 0..61 {
            f.router
                .route_text(&conn, r#"{"type":"message","content":"Hello"}"#)
                .await;
        }

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 61);
        assert!(frames[..60].iter().all(|f| f["success"] == true));
        let last = &frames[60];
        assert_eq!(last["success"], false);
        assert!(last["error"].as_str().unwrap().contains("rate limit"));
        assert_eq!(last["metadata"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(f.backend.calls(), 60);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_heartbeat_replies_without_consuming_rate_limit() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");

        for _ in 0..3 {
            f.router.route_text(&conn, r#"{"type":"heartbeat"}"#).await;
        }
        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["type"] == "heartbeat_ack"));
        assert_eq!(f.limiter.remaining("alice"), 60);
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_connection_usable() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");

        f.router.route_text(&conn, "not json").await;
        f.router.route_text(&conn, r#"{"type":"shout"}"#).await;
        f.router.route_text(&conn, r#"{"type":"message"}"#).await;
        f.router.route_text(&conn, r#"{"type":"heartbeat"}"#).await;

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 4);
        for frame in &frames[..3] {
            assert_eq!(frame["success"], false);
            assert_eq!(frame["metadata"]["code"], "VALIDATION_ERROR");
        }
        assert_eq!(frames[3]["type"], "heartbeat_ack");
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_content_length_is_enforced() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        let raw = json!({ "type": "message", "content": "x".repeat(101) }).to_string();
        f.router.route_text(&conn, &raw).await;
        let frame = &drain_frames(&mut rx)[0];
        assert_eq!(frame["success"], false);
        assert!(frame["error"].as_str().unwrap().contains("100"));
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_user_message() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        f.backend.fail(true);

        f.router
            .route_text(&conn, r#"{"type":"message","content":"Hello"}"#)
            .await;
        let frame = &drain_frames(&mut rx)[0];
        assert_eq!(frame["success"], false);
        assert_eq!(frame["metadata"]["code"], "BACKEND_ERROR");

        let session_id = conn.session_id().unwrap();
        let stored = f.store.messages_in(&session_id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_type, MessageType::User);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        f.store.fail_writes(true);

        f.router
            .route_text(&conn, r#"{"type":"message","content":"Hello"}"#)
            .await;
        let frame = &drain_frames(&mut rx)[0];
        assert_eq!(frame["success"], false);
        assert_eq!(frame["metadata"]["code"], "STORE_UNAVAILABLE");
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_typing_reaches_other_session_members_only() {
        let f = fixture();
        let (first, mut rx1) = f.connect("c1", "alice");
        let (second, mut rx2) = f.connect("c2", "alice");
        let (_other, mut rx3) = f.connect("c3", "bob");

        f.router
            .route_text(&first, r#"{"type":"message","content":"hi"}"#)
            .await;
        let session_id = frame_session(&drain_frames(&mut rx1)[0]);

        let raw = format!(r#"{{"type":"typing","session_id":"{session_id}"}}"#);
        f.router.route_text(&second, &raw).await;

        let frames = drain_frames(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "typing");
        assert_eq!(frames[0]["is_typing"], true);
        assert_eq!(frames[0]["user_id"], "alice");
        assert!(drain_frames(&mut rx2).is_empty());
        assert!(drain_frames(&mut rx3).is_empty());
        assert_eq!(f.store.messages_in(&session_id).len(), 2);
    }

    #[tokio::test]
    async fn test_typing_without_session_is_rejected() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        f.router.route_text(&conn, r#"{"type":"typing"}"#).await;
        assert_eq!(drain_frames(&mut rx)[0]["success"], false);
    }

    #[tokio::test]
    async fn test_presence_goes_to_users_other_connections_when_unbound() {
        let f = fixture();
        let (first, mut rx1) = f.connect("c1", "alice");
        let (_second, mut rx2) = f.connect("c2", "alice");

        f.router
            .route_text(&first, r#"{"type":"presence","content":"away"}"#)
            .await;
        assert!(drain_frames(&mut rx1).is_empty());
        let frame = &drain_frames(&mut rx2)[0];
        assert_eq!(frame["type"], "presence");
        assert_eq!(frame["status"], "away");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_ack_prevents_redelivery() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");

        f.router
            .route_text(&conn, r#"{"type":"message","content":"Hello"}"#)
            .await;
        let frame = &drain_frames(&mut rx)[0];
        let message_id = Uuid::parse_str(frame["message"]["id"].as_str().unwrap()).unwrap();
        assert!(conn.is_pending(&message_id));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.pending_ack(&message_id).unwrap().retry_count, 0);
        let ack = format!(r#"{{"type":"ack","message_id":"{message_id}"}}"#);
        f.router.route_text(&conn, &ack).await;
        assert!(!conn.is_pending(&message_id));

        tokio::time::advance(Duration::from_secs(120)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(drain_frames(&mut rx).is_empty());
        assert_eq!(f.retry.stats().redeliveries, 0);
        assert_eq!(f.retry.stats().acknowledged, 1);
        assert_eq!(f.store.message_status(&message_id), Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let f = fixture();
        let (conn, mut rx) = f.connect("c1", "alice");
        let ack = format!(r#"{{"type":"ack","message_id":"{}"}}"#, Uuid::now_v7());
        f.router.route_text(&conn, &ack).await;
        assert!(drain_frames(&mut rx).is_empty());
    }
}
