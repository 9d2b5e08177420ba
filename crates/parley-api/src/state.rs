//! Application state wiring all services together.
//!
//! AppState pins the generic core components to the SQLite repositories,
//! the in-process cache backend, and the canned reply backend.

use std::sync::Arc;

use anyhow::Context;
use parley_core::auth::TokenValidator;
use parley_core::cache::{
    CacheInvalidationService, CacheLayer, CacheMonitor, CachedMessageRepository,
    CachedSessionRepository, MemoryCacheBackend,
};
use parley_core::chat::SessionService;
use parley_core::realtime::{
    Broadcaster, ConnectionPool, DeliveryFailure, MessageRouter, RateLimiter, RetryManager,
    record_delivery_failures,
};
use parley_infra::backend::CannedReplyBackend;
use parley_infra::sqlite::{
    DatabasePool, SqliteChatRepository, default_database_url, ensure_database_dir,
};
use parley_types::config::ParleyConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::JwtValidator;

pub type SessionRepo = CachedSessionRepository<SqliteChatRepository, MemoryCacheBackend>;
pub type MessageRepo = CachedMessageRepository<SqliteChatRepository, MemoryCacheBackend>;
pub type ConcreteSessionService = SessionService<SessionRepo>;
pub type ConcreteRouter = MessageRouter<SessionRepo, MessageRepo, CannedReplyBackend>;

/// Shared state for the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ParleyConfig>,
    pub sessions: Arc<ConcreteSessionService>,
    pub messages: Arc<MessageRepo>,
    pub router: Arc<ConcreteRouter>,
    pub pool: Arc<ConnectionPool>,
    pub broadcaster: Arc<Broadcaster>,
    pub retry: Arc<RetryManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheLayer<MemoryCacheBackend>>,
    pub validator: Arc<dyn TokenValidator>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Connect to the database and wire every component.
    ///
    /// Returns the receiver for delivery failures, which
    /// [`AppState::spawn_background`] consumes.
    pub async fn init(
        config: ParleyConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<DeliveryFailure>)> {
        let validator = JwtValidator::from_config(&config.auth).context(
            "auth.jwt_secret is not set; configure it or export PARLEY_JWT_SECRET",
        )?;

        let db_url = config.database.url.clone().unwrap_or_else(default_database_url);
        ensure_database_dir(&db_url)
            .await
            .with_context(|| format!("failed to create the directory for {db_url}"))?;
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database at {db_url}"))?;

        Ok(Self::assemble(config, db_pool, Arc::new(validator)))
    }

    /// Wire components over an already-open database.
    pub fn assemble(
        config: ParleyConfig,
        db_pool: DatabasePool,
        validator: Arc<dyn TokenValidator>,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let backend = Arc::new(MemoryCacheBackend::new(config.cache.max_entries));
        let monitor = Arc::new(CacheMonitor::new(config.monitor.clone()));
        let invalidation = Arc::new(CacheInvalidationService::new(
            Arc::clone(&backend),
            config.invalidation.clone(),
        ));
        let cache = Arc::new(CacheLayer::new(
            backend,
            monitor,
            invalidation,
            config.cache.clone(),
        ));

        let session_repo = Arc::new(CachedSessionRepository::new(
            SqliteChatRepository::new(db_pool.clone()),
            Arc::clone(&cache),
        ));
        let messages = Arc::new(CachedMessageRepository::new(
            SqliteChatRepository::new(db_pool.clone()),
            Arc::clone(&cache),
        ));
        let sessions = Arc::new(SessionService::new(session_repo, config.session.clone()));

        let (retry, failures) = RetryManager::new(&config.delivery);
        let retry = Arc::new(retry);
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&retry),
            config.realtime.idle_timeout(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&pool), Arc::clone(&retry)));
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&sessions),
            Arc::clone(&messages),
            Arc::new(CannedReplyBackend::from_config(&config.backend)),
            Arc::clone(&pool),
            Arc::clone(&broadcaster),
            Arc::clone(&rate_limiter),
            config.realtime.max_content_len,
        ));

        let state = Self {
            config: Arc::new(config),
            sessions,
            messages,
            router,
            pool,
            broadcaster,
            retry,
            rate_limiter,
            cache,
            validator,
            db_pool,
        };
        (state, failures)
    }

    /// Start the connection sweeper, the invalidation worker, the delivery
    /// failure recorder, and the session lifecycle sweep.
    pub fn spawn_background(
        &self,
        failures: mpsc::UnboundedReceiver<DeliveryFailure>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.pool).run_sweeper(
                self.config.realtime.sweep_interval(),
                Some(Arc::clone(&self.rate_limiter)),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(self.cache.invalidation()).run(cancel.clone())),
            tokio::spawn(record_delivery_failures(
                failures,
                Arc::clone(&self.messages),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.sessions).run_lifecycle(cancel.clone())),
        ]
    }
}
