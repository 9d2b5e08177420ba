//! Axum router configuration with middleware.
//!
//! Session and diagnostics routes live under `/api/v1/`; the chat socket is
//! `/ws/chat`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/sessions/{id}", delete(handlers::session::end_session))
        .route(
            "/sessions/{id}/messages",
            get(handlers::session::get_messages),
        )
        .route("/cache/metrics", get(handlers::diagnostics::cache_metrics))
        .route("/cache/health", get(handlers::diagnostics::cache_health))
        .route("/cache/report", get(handlers::diagnostics::cache_report))
        .route(
            "/cache/consistency",
            get(handlers::diagnostics::cache_consistency),
        )
        .route(
            "/realtime/stats",
            get(handlers::diagnostics::realtime_stats),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/chat", get(handlers::ws::ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness, store reachability, and the live connection count.
///
/// Answers 503 when the database does not respond.
async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, axum::Json<serde_json::Value>) {
    let (status, database) = match state.db_pool.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach the database");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    let body = serde_json::json!({
        "status": if status.is_success() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "connections": state.pool.connection_count(),
    });
    (status, axum::Json(body))
}
