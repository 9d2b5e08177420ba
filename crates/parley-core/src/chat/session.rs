//! Session lifecycle service.
//!
//! Creates sessions, resolves them for a connected user, records activity,
//! and runs the periodic sweep that moves idle sessions to `inactive` and
//! overdue ones to `expired`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_types::chat::{ChatSession, SessionFilter, SessionStatus, now_micros};
use parley_types::config::SessionConfig;
use parley_types::error::{ChatError, RepositoryError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::SessionRepository;

/// Outcome of one lifecycle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSweep {
    pub inactivated: usize,
    pub expired: usize,
}

/// Orchestrates chat session lifecycle.
///
/// Generic over `SessionRepository` so callers can hand it either the raw
/// store or the cached decorator.
pub struct SessionService<S: SessionRepository> {
    repo: Arc<S>,
    config: SessionConfig,
}

impl<S: SessionRepository> SessionService<S> {
    pub fn new(repo: Arc<S>, config: SessionConfig) -> Self {
        Self { repo, config }
    }

    /// Access the session repository.
    pub fn repository(&self) -> &Arc<S> {
        &self.repo
    }

    /// Create a new active session owned by `user_id`.
    pub async fn create_session(
        &self,
        user_id: &str,
        client_name: Option<&str>,
        context: Option<&str>,
    ) -> Result<ChatSession, RepositoryError> {
        let name = client_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(self.config.default_client_name.as_str());
        let mut session = ChatSession::new(user_id, name, self.config.ttl());
        if let Some(context) = context {
            session.context = context.to_string();
        }

        let created = self.repo.create(&session).await?;
        info!(session_id = %created.id, user_id = %user_id, "Session created");
        Ok(created)
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        self.repo.get_by_id(id).await
    }

    /// All sessions owned by a user, most recently active first.
    pub async fn list_user_sessions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ChatSession>, RepositoryError> {
        self.repo.list_by_user(user_id).await
    }

    /// Load a session on behalf of `user_id` so a message can be written to it.
    ///
    /// Unknown sessions and sessions owned by someone else are reported the
    /// same way. A session found past its expiry is moved to `expired`; an
    /// inactive session is reactivated.
    pub async fn resolve_for_user(
        &self,
        id: &Uuid,
        user_id: &str,
    ) -> Result<ChatSession, ChatError> {
        let mut session = match self.repo.get_by_id(id).await? {
            Some(s) if s.user_id == user_id => s,
            _ => return Err(ChatError::validation(format!("unknown session {id}"))),
        };

        if !session.accepts_messages() {
            return Err(ChatError::validation(format!(
                "session {id} is {}",
                session.status
            )));
        }

        if session.is_past_expiry(Utc::now()) {
            if let Err(e) = self.repo.update_status(id, SessionStatus::Expired).await {
                warn!(session_id = %id, error = %e, "Failed to mark session expired");
            }
            return Err(ChatError::validation(format!("session {id} has expired")));
        }

        if session.status == SessionStatus::Inactive {
            self.repo.update_status(id, SessionStatus::Active).await?;
            session.status = SessionStatus::Active;
            debug!(session_id = %id, "Session reactivated");
        }

        Ok(session)
    }

    /// Record activity on a session now.
    pub async fn update_activity(&self, id: &Uuid) -> Result<(), RepositoryError> {
        self.repo.update_activity(id, now_micros()).await
    }

    /// Terminate a session. Terminal sessions cannot be ended again.
    pub async fn end_session(&self, id: &Uuid) -> Result<ChatSession, ChatError> {
        let mut session = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| ChatError::validation(format!("unknown session {id}")))?;

        if !session.status.can_transition_to(SessionStatus::Terminated) {
            return Err(ChatError::validation(format!(
                "session {id} is already {}",
                session.status
            )));
        }

        self.repo.update_status(id, SessionStatus::Terminated).await?;
        session.status = SessionStatus::Terminated;
        info!(session_id = %id, "Session terminated");
        Ok(session)
    }

    /// Apply inactivity and expiry transitions as of `now`.
    ///
    /// Failures on individual sessions are logged and skipped; only a failed
    /// listing aborts the sweep.
    pub async fn sweep_lifecycle_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<LifecycleSweep, RepositoryError> {
        let mut outcome = LifecycleSweep::default();

        let overdue = self
            .repo
            .list(&SessionFilter {
                expires_before: Some(now),
                ..Default::default()
            })
            .await?;
        for session in overdue.iter().filter(|s| !s.status.is_terminal()) {
            match self.repo.update_status(&session.id, SessionStatus::Expired).await {
                Ok(()) => outcome.expired += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to expire session"),
            }
        }

        let idle = self
            .repo
            .list(&SessionFilter {
                status: Some(SessionStatus::Active),
                idle_before: Some(now - self.config.inactivity_timeout()),
                ..Default::default()
            })
            .await?;
        for session in idle.iter().filter(|s| !s.is_past_expiry(now)) {
            match self.repo.update_status(&session.id, SessionStatus::Inactive).await {
                Ok(()) => outcome.inactivated += 1,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to mark session inactive")
                }
            }
        }

        if outcome != LifecycleSweep::default() {
            info!(
                inactivated = outcome.inactivated,
                expired = outcome.expired,
                "Session lifecycle sweep applied"
            );
        }
        Ok(outcome)
    }

    /// Run the lifecycle sweep on the configured interval until cancelled.
    pub async fn run_lifecycle(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.lifecycle_sweep());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_lifecycle_at(Utc::now()).await {
                        warn!(error = %e, "Session lifecycle sweep failed");
                    }
                }
            }
        }
        debug!("Session lifecycle task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::InMemoryChatStore;

    fn service() -> (SessionService<InMemoryChatStore>, InMemoryChatStore) {
        let store = InMemoryChatStore::new();
        let service = SessionService::new(Arc::new(store.clone()), SessionConfig::default());
        (service, store)
    }

    #[tokio::test]
    async fn test_create_session_uses_default_client_name() {
        let (service, _) = service();
        let session = service.create_session("user-1", None, None).await.unwrap();
        assert_eq!(session.client_name, "Guest");
        assert_eq!(session.status, SessionStatus::Active);

        let named = service
            .create_session("user-1", Some("Acme Corp"), Some("website intake"))
            .await
            .unwrap();
        assert_eq!(named.client_name, "Acme Corp");
        assert_eq!(named.context, "website intake");
        assert_eq!(service.list_user_sessions("user-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_rejects_foreign_and_unknown_sessions() {
        let (service, _) = service();
        let session = service.create_session("owner", None, None).await.unwrap();

        let foreign = service.resolve_for_user(&session.id, "intruder").await;
        let unknown = service.resolve_for_user(&Uuid::now_v7(), "owner").await;
        assert!(matches!(foreign, Err(ChatError::Validation(_))));
        assert!(matches!(unknown, Err(ChatError::Validation(_))));
        assert!(service.resolve_for_user(&session.id, "owner").await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_reactivates_inactive_session() {
        let (service, store) = service();
        let session = service.create_session("u", None, None).await.unwrap();
        store.set_session_status(&session.id, SessionStatus::Inactive);

        let resolved = service.resolve_for_user(&session.id, "u").await.unwrap();
        assert_eq!(resolved.status, SessionStatus::Active);
        let stored = service.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_resolve_expires_overdue_session() {
        let (service, store) = service();
        let session = service.create_session("u", None, None).await.unwrap();
        store.set_session_expiry(&session.id, Utc::now() - chrono::Duration::minutes(1));

        let err = service.resolve_for_user(&session.id, "u").await.unwrap_err();
        assert!(err.to_string().contains("expired"));
        let stored = service.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_end_session_is_terminal() {
        let (service, _) = service();
        let session = service.create_session("u", None, None).await.unwrap();

        let ended = service.end_session(&session.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Terminated);
        assert!(service.end_session(&session.id).await.is_err());
        assert!(service.resolve_for_user(&session.id, "u").await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_sweep_inactivates_and_expires() {
        let (service, store) = service();
        let idle = service.create_session("u", None, None).await.unwrap();
        let overdue = service.create_session("u", None, None).await.unwrap();
        let fresh = service.create_session("u", None, None).await.unwrap();

        let now = Utc::now();
        store.set_session_activity(&idle.id, now - chrono::Duration::minutes(45));
        store.set_session_expiry(&overdue.id, now - chrono::Duration::seconds(1));

        let outcome = service.sweep_lifecycle_at(now).await.unwrap();
        assert_eq!(outcome, LifecycleSweep { inactivated: 1, expired: 1 });

        let status = |id: Uuid| store.session_status(&id).unwrap();
        assert_eq!(status(idle.id), SessionStatus::Inactive);
        assert_eq!(status(overdue.id), SessionStatus::Expired);
        assert_eq!(status(fresh.id), SessionStatus::Active);

        // A second sweep finds nothing new to do.
        let again = service.sweep_lifecycle_at(now).await.unwrap();
        assert_eq!(again, LifecycleSweep::default());
    }
}
