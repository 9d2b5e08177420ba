//! Cache and transport diagnostics.
//!
//! Endpoints:
//! - GET /api/v1/cache/metrics      - Per-operation hit/miss/latency counters
//! - GET /api/v1/cache/health       - Health level with the issues behind it
//! - GET /api/v1/cache/report       - Metrics, health, and tuning recommendations
//! - GET /api/v1/cache/consistency  - Invalidation queue status and staleness
//! - GET /api/v1/realtime/stats     - Connections, pending acks, retry counters

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use parley_core::cache::{
    CacheHealth, CacheMetrics, ConsistencyReport, HealthLevel, PerformanceReport,
};
use parley_core::realtime::{PoolStats, RetryStats};
use serde::Serialize;

use crate::http::response::ApiResponse;
use crate::state::AppState;

pub async fn cache_metrics(State(state): State<AppState>) -> ApiResponse<CacheMetrics> {
    let start = Instant::now();
    ApiResponse::success(state.cache.monitor().metrics(), start)
}

/// Unhealthy caches answer 503 so load balancers can alert on it.
pub async fn cache_health(
    State(state): State<AppState>,
) -> (StatusCode, ApiResponse<CacheHealth>) {
    let start = Instant::now();
    let health = state.cache.monitor().health_status();
    let status = match health.status {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Degraded => StatusCode::OK,
    };
    (status, ApiResponse::success(health, start))
}

pub async fn cache_report(State(state): State<AppState>) -> ApiResponse<PerformanceReport> {
    let start = Instant::now();
    ApiResponse::success(state.cache.monitor().performance_report(), start)
}

pub async fn cache_consistency(State(state): State<AppState>) -> ApiResponse<ConsistencyReport> {
    let start = Instant::now();
    ApiResponse::success(state.cache.invalidation().consistency_report(), start)
}

#[derive(Debug, Serialize)]
pub struct RealtimeStats {
    pub pool: PoolStats,
    pub retry: RetryStats,
    pub rate_limited_users: usize,
    pub invalidation_queue_depth: usize,
}

pub async fn realtime_stats(State(state): State<AppState>) -> ApiResponse<RealtimeStats> {
    let start = Instant::now();
    let stats = RealtimeStats {
        pool: state.pool.stats(),
        retry: state.retry.stats(),
        rate_limited_users: state.rate_limiter.tracked_users(),
        invalidation_queue_depth: state.cache.invalidation().queue_depth(),
    };
    ApiResponse::success(stats, start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use parley_core::realtime::Connection;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_realtime_stats_counts_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _failures) = test_state(&dir).await;
        let (conn, _rx) = Connection::channel("c1", "user-1", 4);
        state.pool.register(Arc::new(conn));
        assert!(state.rate_limiter.allow("user-1"));

        let resp = realtime_stats(State(state)).await;
        let stats = resp.data.unwrap();
        assert_eq!(stats.pool.connections, 1);
        assert_eq!(stats.pool.users, 1);
        assert_eq!(stats.rate_limited_users, 1);
        assert_eq!(stats.retry.pending, 0);
    }

    #[tokio::test]
    async fn test_fresh_cache_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _failures) = test_state(&dir).await;
        let (status, resp) = cache_health(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp.data.unwrap().status, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn test_reports_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _failures) = test_state(&dir).await;

        let report = serde_json::to_value(cache_report(State(state.clone())).await).unwrap();
        assert!(report["data"]["recommendations"].is_array());

        let consistency = serde_json::to_value(cache_consistency(State(state.clone())).await).unwrap();
        assert_eq!(consistency["data"]["status"], "consistent");

        let metrics = serde_json::to_value(cache_metrics(State(state)).await).unwrap();
        assert!(metrics["data"]["kinds"].is_array());
    }
}
