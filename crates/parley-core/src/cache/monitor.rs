//! Cache performance monitoring.
//!
//! Tracks hit/miss/set/error counts and latency samples per operation kind,
//! derives a health status from configurable thresholds, and produces a
//! report with tuning recommendations.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_types::config::MonitorConfig;
use serde::Serialize;
use tokio::time::Instant;

/// The cache operations the monitor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOpKind {
    SessionGet,
    SessionSet,
    MessageGet,
    MessageSet,
    Invalidate,
}

impl CacheOpKind {
    pub const ALL: [CacheOpKind; 5] = [
        CacheOpKind::SessionGet,
        CacheOpKind::SessionSet,
        CacheOpKind::MessageGet,
        CacheOpKind::MessageSet,
        CacheOpKind::Invalidate,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether hit ratio is meaningful for this kind.
    pub fn is_lookup(self) -> bool {
        matches!(self, CacheOpKind::SessionGet | CacheOpKind::MessageGet)
    }
}

impl fmt::Display for CacheOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOpKind::SessionGet => write!(f, "session_get"),
            CacheOpKind::SessionSet => write!(f, "session_set"),
            CacheOpKind::MessageGet => write!(f, "message_get"),
            CacheOpKind::MessageSet => write!(f, "message_set"),
            CacheOpKind::Invalidate => write!(f, "invalidate"),
        }
    }
}

/// Overall cache health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Bounded latency sample window plus lifetime aggregates.
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    total: Duration,
    count: u64,
    max: Duration,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            total: Duration::ZERO,
            count: 0,
            max: Duration::ZERO,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
        self.total += latency;
        self.count += 1;
        self.max = self.max.max(latency);
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let avg_nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(avg_nanos).unwrap_or(u64::MAX))
    }

    /// 95th percentile over the retained samples (nearest rank).
    fn p95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100);
        sorted[rank.saturating_sub(1)]
    }
}

struct KindStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl KindStats {
    fn new(samples: usize) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(samples)),
        }
    }
}

/// Snapshot of one operation kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindMetrics {
    pub kind: CacheOpKind,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub avg_latency_us: u64,
    pub p95_latency_us: u64,
    pub max_latency_us: u64,
    pub samples: u64,
}

/// Snapshot of every counter the monitor keeps.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub kinds: Vec<KindMetrics>,
    pub overall_hit_ratio: f64,
    pub total_errors: u64,
    pub recent_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthLevel,
    pub hit_ratio: f64,
    pub lookups: u64,
    pub recent_errors: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub metrics: CacheMetrics,
    pub health: CacheHealth,
    pub recommendations: Vec<String>,
}

/// Thread-safe cache metrics collector.
///
/// Counters are lock-free; latency windows and the recent-error log take a
/// short `parking_lot` lock.
pub struct CacheMonitor {
    config: MonitorConfig,
    kinds: Vec<KindStats>,
    recent_errors: Mutex<VecDeque<Instant>>,
    started: Instant,
}

impl CacheMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let kinds = CacheOpKind::ALL
            .iter()
            .map(|_| KindStats::new(config.latency_samples))
            .collect();
        Self {
            config,
            kinds,
            recent_errors: Mutex::new(VecDeque::new()),
            started: Instant::now(),
        }
    }

    fn stats(&self, kind: CacheOpKind) -> &KindStats {
        &self.kinds[kind.index()]
    }

    pub fn record_hit(&self, kind: CacheOpKind, latency: Duration) {
        let stats = self.stats(kind);
        stats.hits.fetch_add(1, Ordering::Relaxed);
        stats.latency.lock().record(latency);
    }

    pub fn record_miss(&self, kind: CacheOpKind, latency: Duration) {
        let stats = self.stats(kind);
        stats.misses.fetch_add(1, Ordering::Relaxed);
        stats.latency.lock().record(latency);
    }

    pub fn record_set(&self, kind: CacheOpKind, latency: Duration) {
        let stats = self.stats(kind);
        stats.sets.fetch_add(1, Ordering::Relaxed);
        stats.latency.lock().record(latency);
    }

    pub fn record_error(&self, kind: CacheOpKind) {
        self.stats(kind).errors.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut recent = self.recent_errors.lock();
        recent.push_back(now);
        Self::trim_errors(&mut recent, now, self.config.error_window());
    }

    fn trim_errors(recent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            recent.pop_front();
        }
    }

    /// Errors recorded within the configured error window.
    pub fn recent_error_count(&self) -> usize {
        let mut recent = self.recent_errors.lock();
        Self::trim_errors(&mut recent, Instant::now(), self.config.error_window());
        recent.len()
    }

    /// `hits / (hits + misses)` for one kind; 0.0 before any lookup.
    pub fn hit_ratio(&self, kind: CacheOpKind) -> f64 {
        let stats = self.stats(kind);
        ratio(
            stats.hits.load(Ordering::Relaxed),
            stats.misses.load(Ordering::Relaxed),
        )
    }

    fn lookup_totals(&self) -> (u64, u64) {
        CacheOpKind::ALL
            .iter()
            .filter(|k| k.is_lookup())
            .map(|k| self.stats(*k))
            .fold((0, 0), |(h, m), s| {
                (
                    h + s.hits.load(Ordering::Relaxed),
                    m + s.misses.load(Ordering::Relaxed),
                )
            })
    }

    /// Hit ratio across every lookup kind.
    pub fn overall_hit_ratio(&self) -> f64 {
        let (hits, misses) = self.lookup_totals();
        ratio(hits, misses)
    }

    pub fn kind_metrics(&self, kind: CacheOpKind) -> KindMetrics {
        let stats = self.stats(kind);
        let hits = stats.hits.load(Ordering::Relaxed);
        let misses = stats.misses.load(Ordering::Relaxed);
        let latency = stats.latency.lock();
        KindMetrics {
            kind,
            hits,
            misses,
            sets: stats.sets.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            hit_ratio: ratio(hits, misses),
            avg_latency_us: micros(latency.average()),
            p95_latency_us: micros(latency.p95()),
            max_latency_us: micros(latency.max),
            samples: latency.count,
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let kinds: Vec<KindMetrics> = CacheOpKind::ALL
            .iter()
            .map(|k| self.kind_metrics(*k))
            .collect();
        CacheMetrics {
            generated_at: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            total_errors: kinds.iter().map(|k| k.errors).sum(),
            kinds,
            overall_hit_ratio: self.overall_hit_ratio(),
            recent_errors: self.recent_error_count(),
        }
    }

    /// Classify health from hit ratio and the recent error rate.
    ///
    /// Hit ratio only counts once `min_samples` lookups have been seen, so a
    /// cold cache is not reported unhealthy.
    pub fn health_status(&self) -> CacheHealth {
        let cfg = &self.config;
        let (hits, misses) = self.lookup_totals();
        let lookups = hits + misses;
        let hit_ratio = ratio(hits, misses);
        let recent_errors = self.recent_error_count();

        let mut status = HealthLevel::Healthy;
        let mut issues = Vec::new();

        if lookups >= cfg.min_samples {
            if hit_ratio < cfg.unhealthy_hit_ratio {
                status = status.max(HealthLevel::Unhealthy);
                issues.push(format!("hit ratio {:.1}% is critically low", hit_ratio * 100.0));
            } else if hit_ratio < cfg.degraded_hit_ratio {
                status = status.max(HealthLevel::Degraded);
                issues.push(format!("hit ratio {:.1}% is below target", hit_ratio * 100.0));
            }
        }

        if recent_errors >= cfg.unhealthy_error_count {
            status = status.max(HealthLevel::Unhealthy);
            issues.push(format!(
                "{recent_errors} backend errors in the last {}s",
                cfg.error_window_secs
            ));
        } else if recent_errors >= cfg.degraded_error_count {
            status = status.max(HealthLevel::Degraded);
            issues.push(format!(
                "{recent_errors} backend errors in the last {}s",
                cfg.error_window_secs
            ));
        }

        CacheHealth {
            status,
            hit_ratio,
            lookups,
            recent_errors,
            issues,
        }
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let metrics = self.metrics();
        let health = self.health_status();
        let recommendations = self.recommendations(&metrics, &health);
        PerformanceReport {
            metrics,
            health,
            recommendations,
        }
    }

    fn recommendations(&self, metrics: &CacheMetrics, health: &CacheHealth) -> Vec<String> {
        let cfg = &self.config;
        let slow = Duration::from_millis(cfg.slow_operation_ms);
        let mut out = Vec::new();

        for m in &metrics.kinds {
            if m.kind.is_lookup()
                && m.hits + m.misses >= cfg.min_samples
                && m.hit_ratio < cfg.degraded_hit_ratio
            {
                out.push(format!(
                    "{} hit ratio is {:.1}%: consider a longer TTL or a larger message window",
                    m.kind,
                    m.hit_ratio * 100.0
                ));
            }
            if m.p95_latency_us > micros(slow) {
                out.push(format!(
                    "{} p95 latency is {}ms: check cache backend load and network round trips",
                    m.kind,
                    m.p95_latency_us / 1_000
                ));
            }
        }

        let hits: u64 = metrics
            .kinds
            .iter()
            .filter(|m| m.kind.is_lookup())
            .map(|m| m.hits)
            .sum();
        let sets: u64 = metrics
            .kinds
            .iter()
            .filter(|m| m.kind != CacheOpKind::Invalidate)
            .map(|m| m.sets)
            .sum();
        if sets >= cfg.min_samples && sets > hits.saturating_mul(2) {
            out.push(
                "entries are rewritten far more often than they are read: \
                 invalidation may be too aggressive for the traffic pattern"
                    .to_string(),
            );
        }

        if health.recent_errors > 0 {
            out.push(format!(
                "{} cache errors in the last {}s: reads are falling back to the store",
                health.recent_errors, cfg.error_window_secs
            ));
        }

        if out.is_empty() {
            out.push("cache is operating within configured thresholds".to_string());
        }
        out
    }

    /// Zero every counter (useful for testing and after config changes).
    pub fn reset(&self) {
        for stats in &self.kinds {
            stats.hits.store(0, Ordering::Relaxed);
            stats.misses.store(0, Ordering::Relaxed);
            stats.sets.store(0, Ordering::Relaxed);
            stats.errors.store(0, Ordering::Relaxed);
            *stats.latency.lock() = LatencyWindow::new(self.config.latency_samples);
        }
        self.recent_errors.lock().clear();
    }
}

impl Default for CacheMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl fmt::Debug for CacheMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMonitor")
            .field("overall_hit_ratio", &self.overall_hit_ratio())
            .field("recent_errors", &self.recent_error_count())
            .finish()
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> CacheMonitor {
        CacheMonitor::new(MonitorConfig {
            min_samples: 10,
            ..Default::default()
        })
    }

    const FAST: Duration = Duration::from_micros(200);

    #[test]
    fn test_hit_ratio_per_kind() {
        let m = monitor();
        for _ in 0..3 {
            m.record_hit(CacheOpKind::MessageGet, FAST);
        }
        m.record_miss(CacheOpKind::MessageGet, FAST);
        m.record_miss(CacheOpKind::SessionGet, FAST);

        assert!((m.hit_ratio(CacheOpKind::MessageGet) - 0.75).abs() < f64::EPSILON);
        assert_eq!(m.hit_ratio(CacheOpKind::SessionGet), 0.0);
        assert_eq!(m.hit_ratio(CacheOpKind::MessageSet), 0.0);
        assert!((m.overall_hit_ratio() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_cold_cache_is_healthy() {
        let m = monitor();
        for _ in 0..5 {
            m.record_miss(CacheOpKind::SessionGet, FAST);
        }
        assert_eq!(m.health_status().status, HealthLevel::Healthy);
    }

    #[test]
    fn test_low_hit_ratio_degrades_then_fails() {
        let m = monitor();
        // 4 hits / 10 lookups = 40%: below degraded (50%), above unhealthy (20%).
        for _ in 0..4 {
            m.record_hit(CacheOpKind::MessageGet, FAST);
        }
        for _ in 0..6 {
            m.record_miss(CacheOpKind::MessageGet, FAST);
        }
        assert_eq!(m.health_status().status, HealthLevel::Degraded);

        for _ in 0..20 {
            m.record_miss(CacheOpKind::MessageGet, FAST);
        }
        let health = m.health_status();
        assert_eq!(health.status, HealthLevel::Unhealthy);
        assert!(!health.issues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_errors_age_out_of_window() {
        let m = monitor();
        for _ in 0..10 {
            m.record_error(CacheOpKind::SessionGet);
        }
        assert_eq!(m.health_status().status, HealthLevel::Degraded);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(m.recent_error_count(), 0);
        assert_eq!(m.health_status().status, HealthLevel::Healthy);
        assert_eq!(m.metrics().total_errors, 10);
    }

    #[test]
    fn test_latency_percentiles() {
        let m = monitor();
        for ms in 1..=100 {
            m.record_hit(CacheOpKind::SessionGet, Duration::from_millis(ms));
        }
        let k = m.kind_metrics(CacheOpKind::SessionGet);
        assert_eq!(k.p95_latency_us, 95_000);
        assert_eq!(k.max_latency_us, 100_000);
        assert_eq!(k.avg_latency_us, 50_500);
        assert_eq!(k.samples, 100);
    }

    #[test]
    fn test_report_recommends_on_low_hit_ratio_and_slowness() {
        let m = monitor();
        for _ in 0..10 {
            m.record_miss(CacheOpKind::MessageGet, Duration::from_millis(80));
        }
        let report = m.performance_report();
        assert!(report.recommendations.iter().any(|r| r.contains("message_get hit ratio")));
        assert!(report.recommendations.iter().any(|r| r.contains("p95 latency")));
    }

    #[test]
    fn test_report_on_quiet_cache() {
        let m = monitor();
        let report = m.performance_report();
        assert_eq!(report.health.status, HealthLevel::Healthy);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("within configured thresholds"));
    }

    #[test]
    fn test_reset_clears_counters() {
        let m = monitor();
        m.record_hit(CacheOpKind::SessionGet, FAST);
        m.record_error(CacheOpKind::SessionSet);
        m.reset();
        let metrics = m.metrics();
        assert_eq!(metrics.total_errors, 0);
        assert_eq!(metrics.recent_errors, 0);
        assert_eq!(m.kind_metrics(CacheOpKind::SessionGet).hits, 0);
    }
}
