//! Read-through caching decorator for `SessionRepository`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_types::chat::{ChatSession, SessionFilter, SessionStatus};
use parley_types::error::RepositoryError;
use uuid::Uuid;

use super::backend::CacheBackend;
use super::invalidation::InvalidationTarget;
use super::keys;
use super::layer::CacheLayer;
use super::monitor::CacheOpKind;
use crate::repository::SessionRepository;

/// Caches single sessions and per-user session lists in front of `R`.
///
/// A session's own key is invalidated synchronously after every write, so
/// `get_by_id` always reflects the last committed write. The owner's
/// session list is invalidated through the async queue.
pub struct CachedSessionRepository<R: SessionRepository, C: CacheBackend> {
    inner: R,
    layer: Arc<CacheLayer<C>>,
}

impl<R: SessionRepository, C: CacheBackend> CachedSessionRepository<R, C> {
    pub fn new(inner: R, layer: Arc<CacheLayer<C>>) -> Self {
        Self { inner, layer }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn layer(&self) -> &Arc<CacheLayer<C>> {
        &self.layer
    }

    async fn owner_of(&self, id: &Uuid) -> Result<Option<String>, RepositoryError> {
        if let Some(session) = self
            .layer
            .read::<ChatSession>(CacheOpKind::SessionGet, &keys::session(id))
            .await
        {
            return Ok(Some(session.user_id));
        }
        Ok(self.inner.get_by_id(id).await?.map(|s| s.user_id))
    }

    async fn after_write(&self, id: &Uuid, user_id: Option<&str>) {
        self.layer.invalidate(&keys::session(id)).await;
        if let Some(user_id) = user_id {
            self.invalidate_user_list(user_id);
        }
    }

    fn invalidate_user_list(&self, user_id: &str) {
        self.layer.invalidate_deferred(
            &keys::user_sessions(user_id),
            InvalidationTarget::UserSessions {
                user_id: user_id.to_string(),
            },
        );
    }
}

impl<R: SessionRepository, C: CacheBackend> SessionRepository for CachedSessionRepository<R, C> {
    async fn create(&self, session: &ChatSession) -> Result<ChatSession, RepositoryError> {
        let created = self.inner.create(session).await?;
        self.after_write(&created.id, Some(&created.user_id)).await;
        Ok(created)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        let key = keys::session(id);
        let ticket = self.layer.begin_read(&key);
        if let Some(session) = self.layer.read(CacheOpKind::SessionGet, &key).await {
            return Ok(Some(session));
        }

        let session = self.inner.get_by_id(id).await?;
        if let Some(session) = &session {
            let ttl = self.layer.config().session_ttl();
            self.layer
                .populate(CacheOpKind::SessionSet, &key, session, ttl, &ticket)
                .await;
        }
        Ok(session)
    }

    async fn update(&self, session: &ChatSession) -> Result<(), RepositoryError> {
        self.inner.update(session).await?;
        self.after_write(&session.id, Some(&session.user_id)).await;
        Ok(())
    }

    async fn update_status(&self, id: &Uuid, status: SessionStatus) -> Result<(), RepositoryError> {
        self.inner.update_status(id, status).await?;
        let owner = self.owner_of(id).await.ok().flatten();
        self.after_write(id, owner.as_deref()).await;
        Ok(())
    }

    async fn update_activity(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.inner.update_activity(id, at).await?;
        let owner = self.owner_of(id).await.ok().flatten();
        self.after_write(id, owner.as_deref()).await;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ChatSession>, RepositoryError> {
        let key = keys::user_sessions(user_id);
        let ticket = self.layer.begin_read(&key);
        if let Some(sessions) = self.layer.read(CacheOpKind::SessionGet, &key).await {
            return Ok(sessions);
        }

        let sessions = self.inner.list_by_user(user_id).await?;
        let ttl = self.layer.config().user_sessions_ttl();
        self.layer
            .populate(CacheOpKind::SessionSet, &key, &sessions, ttl, &ticket)
            .await;
        Ok(sessions)
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, RepositoryError> {
        self.inner.list(filter).await
    }
}
