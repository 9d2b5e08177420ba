//! Read-through caching decorator for `MessageRepository`.

use std::sync::Arc;

use parley_types::chat::{ChatMessage, MessageFilter, MessageStatus};
use parley_types::error::RepositoryError;
use uuid::Uuid;

use super::backend::CacheBackend;
use super::invalidation::InvalidationTarget;
use super::keys;
use super::layer::CacheLayer;
use super::monitor::CacheOpKind;
use crate::repository::MessageRepository;

/// Caches the newest window of each session, single messages, and search
/// pages in front of `R`.
///
/// Only first-page reads (`offset = 0`, `limit` within the window) are
/// served from the cache; deeper pages always go to the store. The window
/// and single-message keys are invalidated synchronously after every write;
/// search pages go through the async queue.
pub struct CachedMessageRepository<R: MessageRepository, C: CacheBackend> {
    inner: R,
    layer: Arc<CacheLayer<C>>,
}

impl<R: MessageRepository, C: CacheBackend> CachedMessageRepository<R, C> {
    pub fn new(inner: R, layer: Arc<CacheLayer<C>>) -> Self {
        Self { inner, layer }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn layer(&self) -> &Arc<CacheLayer<C>> {
        &self.layer
    }

    fn window(&self) -> i64 {
        i64::try_from(self.layer.config().message_window).unwrap_or(i64::MAX)
    }

    async fn after_write(&self, session_id: &Uuid, message_ids: &[Uuid]) {
        for id in message_ids {
            self.layer.invalidate(&keys::message(id)).await;
        }
        self.layer
            .invalidate(&keys::session_messages(session_id))
            .await;
        self.layer.invalidate_deferred(
            &keys::search_prefix(session_id),
            InvalidationTarget::SessionMessages {
                session_id: *session_id,
            },
        );
    }

    async fn existing(&self, id: &Uuid) -> Result<ChatMessage, RepositoryError> {
        self.inner
            .get_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }
}

/// The last `limit` entries of an ascending window.
fn tail(mut window: Vec<ChatMessage>, limit: i64) -> Vec<ChatMessage> {
    let keep = usize::try_from(limit).unwrap_or(0);
    let skip = window.len().saturating_sub(keep);
    window.drain(..skip);
    window
}

impl<R: MessageRepository, C: CacheBackend> MessageRepository for CachedMessageRepository<R, C> {
    async fn create(&self, message: &ChatMessage) -> Result<ChatMessage, RepositoryError> {
        let created = self.inner.create(message).await?;
        self.after_write(&created.session_id, &[]).await;
        Ok(created)
    }

    async fn update(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        let previous = self.existing(&message.id).await?;
        self.inner.update(message).await?;
        self.after_write(&previous.session_id, &[message.id]).await;
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let previous = self.existing(id).await?;
        self.inner.delete(id).await?;
        self.after_write(&previous.session_id, &[*id]).await;
        Ok(())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        let key = keys::message(id);
        let ticket = self.layer.begin_read(&key);
        if let Some(message) = self.layer.read(CacheOpKind::MessageGet, &key).await {
            return Ok(Some(message));
        }

        let message = self.inner.get_by_id(id).await?;
        if let Some(message) = &message {
            let ttl = self.layer.config().message_ttl();
            self.layer
                .populate(CacheOpKind::MessageSet, &key, message, ttl, &ticket)
                .await;
        }
        Ok(message)
    }

    async fn get_by_session_id(
        &self,
        session_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let window = self.window();
        if offset != 0 || limit <= 0 || limit > window {
            return self.inner.get_by_session_id(session_id, limit, offset).await;
        }

        let key = keys::session_messages(session_id);
        let ticket = self.layer.begin_read(&key);
        if let Some(cached) = self
            .layer
            .read::<Vec<ChatMessage>>(CacheOpKind::MessageGet, &key)
            .await
        {
            return Ok(tail(cached, limit));
        }

        let loaded = self.inner.get_by_session_id(session_id, window, 0).await?;
        let ttl = self.layer.config().message_ttl();
        self.layer
            .populate(CacheOpKind::MessageSet, &key, &loaded, ttl, &ticket)
            .await;
        Ok(tail(loaded, limit))
    }

    async fn list(&self, filter: &MessageFilter) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.inner.list(filter).await
    }

    async fn search(
        &self,
        session_id: &Uuid,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let key = keys::search(session_id, query, limit);
        let ticket = self.layer.begin_read(&keys::search_prefix(session_id));
        if let Some(hits) = self.layer.read(CacheOpKind::MessageGet, &key).await {
            return Ok(hits);
        }

        let hits = self.inner.search(session_id, query, limit).await?;
        let ttl = self.layer.config().search_ttl();
        self.layer
            .populate(CacheOpKind::MessageSet, &key, &hits, ttl, &ticket)
            .await;
        Ok(hits)
    }

    async fn update_status(&self, id: &Uuid, status: MessageStatus) -> Result<(), RepositoryError> {
        let previous = self.existing(id).await?;
        self.inner.update_status(id, status).await?;
        self.after_write(&previous.session_id, &[*id]).await;
        Ok(())
    }

    async fn delete_by_session_id(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        let ids: Vec<Uuid> = self
            .inner
            .list(&MessageFilter {
                session_id: Some(*session_id),
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        let removed = self.inner.delete_by_session_id(session_id).await?;
        self.after_write(session_id, &ids).await;
        Ok(removed)
    }

    async fn count_by_session(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        self.inner.count_by_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SessionRepository;
    use crate::testutil::{InMemoryChatStore, ToggleCacheBackend, cache_layer};
    use parley_types::chat::{ChatSession, MessageType};

    type Repo = CachedMessageRepository<InMemoryChatStore, ToggleCacheBackend>;

    async fn setup() -> (Repo, InMemoryChatStore, Arc<ToggleCacheBackend>, Uuid) {
        let store = InMemoryChatStore::new();
        let session = ChatSession::new("u", "Acme", chrono::Duration::hours(1));
        SessionRepository::create(&store, &session).await.unwrap();
        let backend = Arc::new(ToggleCacheBackend::new());
        let repo = CachedMessageRepository::new(store.clone(), cache_layer(backend.clone()));
        (repo, store, backend, session.id)
    }

    async fn add(repo: &Repo, session_id: Uuid, content: &str) -> ChatMessage {
        repo.create(&ChatMessage::new(session_id, MessageType::User, content))
            .await
            .unwrap()
    }

    fn contents(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_page_is_cached() {
        let (repo, store, _, sid) = setup().await;
        for i in 0..5 {
            add(&repo, sid, &format!("m{i}")).await;
        }

        let first = repo.get_by_session_id(&sid, 3, 0).await.unwrap();
        let second = repo.get_by_session_id(&sid, 3, 0).await.unwrap();
        assert_eq!(contents(&first), vec!["m2", "m3", "m4"]);
        assert_eq!(first, second);
        assert_eq!(store.message_pages(), 1);

        // A different limit within the window is served from the same entry.
        let all = repo.get_by_session_id(&sid, 50, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(store.message_pages(), 1);
    }

    #[tokio::test]
    async fn test_first_page_miss_then_hit_in_order() {
        let (repo, _, _, sid) = setup().await;
        for i in 0..5 {
            add(&repo, sid, &format!("m{i}")).await;
        }
        let monitor = Arc::clone(repo.layer().monitor());

        let first = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        let gets = monitor.kind_metrics(CacheOpKind::MessageGet);
        assert_eq!((gets.misses, gets.hits), (1, 0));

        let second = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        let gets = monitor.kind_metrics(CacheOpKind::MessageGet);
        assert_eq!((gets.misses, gets.hits), (1, 1));

        assert_eq!(first, second);
        assert_eq!(contents(&second), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(second.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_update_replaces_content_in_cached_window() {
        let (repo, _, _, sid) = setup().await;
        add(&repo, sid, "draft").await;
        let mut edited = add(&repo, sid, "typo").await;
        repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        repo.get_by_id(&edited.id).await.unwrap();

        edited.content = "fixed".to_string();
        repo.update(&edited).await.unwrap();

        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(contents(&page), vec!["draft", "fixed"]);
        let single = repo.get_by_id(&edited.id).await.unwrap().unwrap();
        assert_eq!(single.content, "fixed");
        assert_eq!(repo.layer().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_read_after_write_sees_new_message() {
        let (repo, _, _, sid) = setup().await;
        add(&repo, sid, "hello").await;
        assert_eq!(repo.get_by_session_id(&sid, 10, 0).await.unwrap().len(), 1);

        let reply = add(&repo, sid, "world").await;
        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(page.last().unwrap().id, reply.id);
    }

    #[tokio::test]
    async fn test_deep_pages_bypass_cache() {
        let (repo, store, _, sid) = setup().await;
        for i in 0..6 {
            add(&repo, sid, &format!("m{i}")).await;
        }

        let older = repo.get_by_session_id(&sid, 2, 2).await.unwrap();
        assert_eq!(contents(&older), vec!["m2", "m3"]);
        repo.get_by_session_id(&sid, 2, 2).await.unwrap();
        repo.get_by_session_id(&sid, 51, 0).await.unwrap();
        assert_eq!(store.message_pages(), 3);
    }

    #[tokio::test]
    async fn test_cached_and_uncached_reads_agree() {
        let (repo, store, _, sid) = setup().await;
        for i in 0..12 {
            add(&repo, sid, &format!("m{i}")).await;
        }
        for limit in [1, 5, 12, 20] {
            let cached = repo.get_by_session_id(&sid, limit, 0).await.unwrap();
            let direct = MessageRepository::get_by_session_id(&store, &sid, limit, 0)
                .await
                .unwrap();
            assert_eq!(cached, direct);
        }
    }

    #[tokio::test]
    async fn test_status_update_invalidates_window_and_message() {
        let (repo, store, _, sid) = setup().await;
        let m = add(&repo, sid, "hi").await;
        repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        repo.get_by_id(&m.id).await.unwrap();

        repo.update_status(&m.id, MessageStatus::Failed).await.unwrap();
        assert_eq!(store.message_status(&m.id), Some(MessageStatus::Failed));
        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(page[0].status, MessageStatus::Failed);
        let single = repo.get_by_id(&m.id).await.unwrap().unwrap();
        assert_eq!(single.status, MessageStatus::Failed);

        let missing = repo.update_status(&Uuid::now_v7(), MessageStatus::Read).await;
        assert!(matches!(missing, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn test_search_results_cached_until_invalidated() {
        let (repo, store, _, sid) = setup().await;
        add(&repo, sid, "What does pricing look like?").await;
        repo.layer().invalidation().drain().await;

        assert_eq!(repo.search(&sid, "pricing", 10).await.unwrap().len(), 1);
        assert_eq!(repo.search(&sid, "PRICING", 10).await.unwrap().len(), 1);
        assert_eq!(store.searches(), 1);

        add(&repo, sid, "Pricing depends on scope").await;
        repo.layer().invalidation().drain().await;
        assert_eq!(repo.search(&sid, "pricing", 10).await.unwrap().len(), 2);
        assert_eq!(store.searches(), 2);
    }

    #[tokio::test]
    async fn test_search_whitespace_is_part_of_the_query() {
        let (repo, store, _, sid) = setup().await;
        add(&repo, sid, "cloud-native").await;
        repo.layer().invalidation().drain().await;

        assert_eq!(repo.search(&sid, "cloud", 10).await.unwrap().len(), 1);
        let padded = repo.search(&sid, "cloud ", 10).await.unwrap();
        let direct = MessageRepository::search(&store, &sid, "cloud ", 10)
            .await
            .unwrap();
        assert!(padded.is_empty());
        assert_eq!(padded, direct);
    }

    #[tokio::test]
    async fn test_failed_invalidation_never_serves_stale_window() {
        let (repo, _, backend, sid) = setup().await;
        add(&repo, sid, "first").await;
        repo.get_by_session_id(&sid, 10, 0).await.unwrap();

        backend.fail_deletes(true);
        add(&repo, sid, "second").await;
        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(contents(&page), vec!["first", "second"]);

        backend.fail_deletes(false);
        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(contents(&page), vec!["first", "second"]);
        assert_eq!(repo.layer().dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_outage_is_transparent() {
        let (repo, store, backend, sid) = setup().await;
        backend.fail_all(true);
        add(&repo, sid, "a").await;
        add(&repo, sid, "b").await;

        let page = repo.get_by_session_id(&sid, 10, 0).await.unwrap();
        assert_eq!(contents(&page), vec!["a", "b"]);
        assert_eq!(store.message_pages(), 1);
        assert!(repo.layer().monitor().recent_error_count() > 0);
    }

    #[tokio::test]
    async fn test_delete_by_session_clears_cached_messages() {
        let (repo, _, _, sid) = setup().await;
        let m = add(&repo, sid, "gone soon").await;
        repo.get_by_id(&m.id).await.unwrap();
        repo.get_by_session_id(&sid, 10, 0).await.unwrap();

        assert_eq!(repo.delete_by_session_id(&sid).await.unwrap(), 1);
        assert!(repo.get_by_id(&m.id).await.unwrap().is_none());
        assert!(repo.get_by_session_id(&sid, 10, 0).await.unwrap().is_empty());
    }
}
