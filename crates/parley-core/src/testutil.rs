//! In-memory doubles shared by this crate's unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_types::chat::{
    ChatMessage, ChatSession, MessageFilter, MessageStatus, SessionFilter, SessionStatus,
    sort_chronologically,
};
use parley_types::config::{CacheConfig, InvalidationConfig, MonitorConfig};
use parley_types::error::{CacheError, ChatError, RepositoryError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::backend::CacheBackend;
use crate::cache::invalidation::CacheInvalidationService;
use crate::cache::layer::CacheLayer;
use crate::cache::memory::MemoryCacheBackend;
use crate::cache::monitor::CacheMonitor;
use crate::chat::backend::{ChatBackend, ChatReply};
use crate::realtime::connection::Connection;
use crate::repository::{MessageRepository, SessionRepository};

#[derive(Default)]
struct StoreState {
    sessions: HashMap<Uuid, ChatSession>,
    messages: HashMap<Uuid, ChatMessage>,
}

#[derive(Default)]
struct Counters {
    session_reads: AtomicUsize,
    session_lists: AtomicUsize,
    message_pages: AtomicUsize,
    message_reads: AtomicUsize,
    searches: AtomicUsize,
}

/// Both repositories over shared in-memory maps. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryChatStore {
    state: Arc<Mutex<StoreState>>,
    counters: Arc<Counters>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn session_reads(&self) -> usize {
        self.counters.session_reads.load(Ordering::SeqCst)
    }

    pub fn session_lists(&self) -> usize {
        self.counters.session_lists.load(Ordering::SeqCst)
    }

    pub fn message_pages(&self) -> usize {
        self.counters.message_pages.load(Ordering::SeqCst)
    }

    pub fn message_reads(&self) -> usize {
        self.counters.message_reads.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.counters.searches.load(Ordering::SeqCst)
    }

    pub fn session_status(&self, id: &Uuid) -> Option<SessionStatus> {
        self.state.lock().sessions.get(id).map(|s| s.status)
    }

    pub fn message_status(&self, id: &Uuid) -> Option<MessageStatus> {
        self.state.lock().messages.get(id).map(|m| m.status)
    }

    pub fn messages_in(&self, session_id: &Uuid) -> Vec<ChatMessage> {
        let mut out: Vec<ChatMessage> = self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.session_id == *session_id)
            .cloned()
            .collect();
        sort_chronologically(&mut out);
        out
    }

    pub fn set_session_status(&self, id: &Uuid, status: SessionStatus) {
        if let Some(s) = self.state.lock().sessions.get_mut(id) {
            s.status = status;
        }
    }

    pub fn set_session_expiry(&self, id: &Uuid, at: DateTime<Utc>) {
        if let Some(s) = self.state.lock().sessions.get_mut(id) {
            s.expires_at = at;
        }
    }

    pub fn set_session_activity(&self, id: &Uuid, at: DateTime<Utc>) {
        if let Some(s) = self.state.lock().sessions.get_mut(id) {
            s.last_activity_at = at;
        }
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

fn page<T: Clone>(items: &[T], offset: Option<i64>, limit: Option<i64>) -> Vec<T> {
    let offset = offset.unwrap_or(0).max(0) as usize;
    let limit = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
    items.iter().skip(offset).take(limit).cloned().collect()
}

impl SessionRepository for InMemoryChatStore {
    async fn create(&self, session: &ChatSession) -> Result<ChatSession, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if state.sessions.contains_key(&session.id) {
            return Err(RepositoryError::Conflict(format!("session {}", session.id)));
        }
        state.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        self.counters.session_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().sessions.get(id).cloned())
    }

    async fn update(&self, session: &ChatSession) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let slot = state
            .sessions
            .get_mut(&session.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = session.clone();
        Ok(())
    }

    async fn update_status(&self, id: &Uuid, status: SessionStatus) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn update_activity(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        session.last_activity_at = at;
        session.updated_at = at;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ChatSession>, RepositoryError> {
        SessionRepository::list(
            self,
            &SessionFilter {
                user_id: Some(user_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, RepositoryError> {
        self.counters.session_lists.fetch_add(1, Ordering::SeqCst);
        let mut sessions: Vec<ChatSession> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(page(&sessions, filter.offset, filter.limit))
    }
}

impl MessageRepository for InMemoryChatStore {
    async fn create(&self, message: &ChatMessage) -> Result<ChatMessage, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&message.session_id) {
            return Err(RepositoryError::Conflict(format!(
                "session {} does not exist",
                message.session_id
            )));
        }
        state.messages.insert(message.id, message.clone());
        Ok(message.clone())
    }

    async fn update(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let slot = state
            .messages
            .get_mut(&message.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = message.clone();
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.state
            .lock()
            .messages
            .remove(id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        self.counters.message_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().messages.get(id).cloned())
    }

    async fn get_by_session_id(
        &self,
        session_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.counters.message_pages.fetch_add(1, Ordering::SeqCst);
        let all = self.messages_in(session_id);
        let end = all.len().saturating_sub(offset.max(0) as usize);
        let start = end.saturating_sub(limit.max(0) as usize);
        Ok(all[start..end].to_vec())
    }

    async fn list(&self, filter: &MessageFilter) -> Result<Vec<ChatMessage>, RepositoryError> {
        let mut messages: Vec<ChatMessage> = self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_chronologically(&mut messages);
        Ok(page(&messages, filter.offset, filter.limit))
    }

    async fn search(
        &self,
        session_id: &Uuid,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.counters.searches.fetch_add(1, Ordering::SeqCst);
        let needle = query.to_lowercase();
        let hits: Vec<ChatMessage> = self
            .messages_in(session_id)
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect();
        Ok(page(&hits, None, Some(limit)))
    }

    async fn update_status(&self, id: &Uuid, status: MessageStatus) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let message = state.messages.get_mut(id).ok_or(RepositoryError::NotFound)?;
        message.status = status;
        Ok(())
    }

    async fn delete_by_session_id(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|_, m| m.session_id != *session_id);
        Ok((before - state.messages.len()) as u64)
    }

    async fn count_by_session(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self.messages_in(session_id).len() as u64)
    }
}

/// Memory backend whose operations can be made to fail on demand.
#[derive(Default)]
pub struct ToggleCacheBackend {
    inner: MemoryCacheBackend,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl ToggleCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_reads(fail);
        self.fail_writes(fail);
        self.fail_deletes(fail);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn check(flag: &AtomicBool) -> Result<(), CacheError> {
        if flag.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected cache failure".into()));
        }
        Ok(())
    }
}

impl CacheBackend for ToggleCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Self::check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        Self::check(&self.fail_writes)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Self::check(&self.fail_deletes)?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        Self::check(&self.fail_deletes)?;
        self.inner.delete_prefix(prefix).await
    }
}

/// Build a cache layer over `backend` with default settings.
pub fn cache_layer<C: CacheBackend>(backend: Arc<C>) -> Arc<CacheLayer<C>> {
    let monitor = Arc::new(CacheMonitor::new(MonitorConfig::default()));
    let invalidation = Arc::new(CacheInvalidationService::new(
        backend.clone(),
        InvalidationConfig::default(),
    ));
    Arc::new(CacheLayer::new(
        backend,
        monitor,
        invalidation,
        CacheConfig::default(),
    ))
}

/// Backend that echoes the user's content, or fails when told to.
#[derive(Default)]
pub struct EchoBackend {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl EchoBackend {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChatBackend for EchoBackend {
    async fn send_message(&self, _session_id: &Uuid, content: &str) -> Result<ChatReply, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Backend("echo backend offline".into()));
        }
        Ok(ChatReply::text(format!("echo: {content}")))
    }
}

/// A connection with a 64-frame outbound queue and its receiving end.
pub fn connection(id: &str, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
    let (conn, rx) = Connection::channel(id, user_id, 64);
    (Arc::new(conn), rx)
}

/// Decode every frame currently queued on `rx`.
pub fn drain_frames(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str(&frame) {
            frames.push(value);
        }
    }
    frames
}
