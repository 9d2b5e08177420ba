//! Configuration types for Parley.
//!
//! `ParleyConfig` represents the top-level `config.toml`. Every section and
//! field has a default, so an empty file (or no file at all) yields a working
//! configuration with the documented transport constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the Parley service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
    pub rate_limit: RateLimitConfig,
    pub delivery: DeliveryConfig,
    pub cache: CacheConfig,
    pub invalidation: InvalidationConfig,
    pub monitor: MonitorConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

impl ParleyConfig {
    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: ParleyConfig =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values that would disable or wedge a component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, u64); 12] = [
            ("realtime.heartbeat_interval_secs", self.realtime.heartbeat_interval_secs),
            ("realtime.idle_timeout_secs", self.realtime.idle_timeout_secs),
            ("realtime.sweep_interval_secs", self.realtime.sweep_interval_secs),
            ("realtime.outbound_buffer", self.realtime.outbound_buffer as u64),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("rate_limit.max_messages", u64::from(self.rate_limit.max_messages)),
            ("delivery.ack_timeout_secs", self.delivery.ack_timeout_secs),
            ("cache.message_window", self.cache.message_window as u64),
            ("invalidation.queue_capacity", self.invalidation.queue_capacity as u64),
            ("invalidation.batch_size", self.invalidation.batch_size as u64),
            ("session.ttl_hours", self.session.ttl_hours),
            ("session.lifecycle_sweep_secs", self.session.lifecycle_sweep_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.realtime.idle_timeout_secs <= self.realtime.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "realtime.idle_timeout_secs must exceed realtime.heartbeat_interval_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.degraded_hit_ratio)
            || !(0.0..=1.0).contains(&self.monitor.unhealthy_hit_ratio)
        {
            return Err(ConfigError::Invalid("monitor hit ratios must be within 0..=1".into()));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Durable store location. `None` resolves to `~/.parley/parley.db`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// Bearer-token validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret. Required to accept connections.
    pub jwt_secret: Option<String>,
    /// Expected `iss` claim, if any.
    pub issuer: Option<String>,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            leeway_secs: 30,
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
    /// Maximum accepted message content length in characters.
    pub max_content_len: usize,
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            outbound_buffer: 256,
            max_content_len: 8_000,
        }
    }
}

/// Sliding-window admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_messages: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_messages: 60,
        }
    }
}

/// Delivery acknowledgment and redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ack_timeout_secs: u64,
    /// Redeliveries before a message is reported failed.
    pub max_retries: u32,
}

impl DeliveryConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Read-through cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Most recent messages kept per session.
    pub message_window: usize,
    pub session_ttl_secs: u64,
    pub message_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub user_sessions_ttl_secs: u64,
    /// Entry cap for the in-process backend.
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }

    pub fn user_sessions_ttl(&self) -> Duration {
        Duration::from_secs(self.user_sessions_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message_window: 50,
            session_ttl_secs: 1_800,
            message_ttl_secs: 600,
            search_ttl_secs: 120,
            user_sessions_ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

/// Asynchronous invalidation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Attempts per event before it is counted as failed.
    pub max_attempts: u32,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            max_attempts: 3,
        }
    }
}

/// Cache health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Lookups required before the hit ratio affects health.
    pub min_samples: u64,
    /// Below this overall hit ratio the cache is degraded.
    pub degraded_hit_ratio: f64,
    /// Below this overall hit ratio the cache is unhealthy.
    pub unhealthy_hit_ratio: f64,
    pub degraded_error_count: usize,
    pub unhealthy_error_count: usize,
    pub error_window_secs: u64,
    /// Latency samples retained per operation kind.
    pub latency_samples: usize,
    pub slow_operation_ms: u64,
}

impl MonitorConfig {
    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            degraded_hit_ratio: 0.5,
            unhealthy_hit_ratio: 0.2,
            degraded_error_count: 10,
            unhealthy_error_count: 50,
            error_window_secs: 300,
            latency_samples: 1_000,
            slow_operation_ms: 50,
        }
    }
}

/// Upper bound for session durations (100 years), keeps chrono arithmetic in range.
const MAX_HOURS: u64 = 24 * 365 * 100;

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: u64,
    /// Active sessions idle this long become inactive.
    pub inactivity_timeout_mins: u64,
    pub lifecycle_sweep_secs: u64,
    pub default_client_name: String,
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours.min(MAX_HOURS) as i64)
    }

    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.inactivity_timeout_mins.min(MAX_HOURS * 60) as i64)
    }

    pub fn lifecycle_sweep(&self) -> Duration {
        Duration::from_secs(self.lifecycle_sweep_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            inactivity_timeout_mins: 30,
            lifecycle_sweep_secs: 60,
            default_client_name: "Guest".to_string(),
        }
    }
}

/// Settings for the built-in canned-reply chat backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Reply template; `{content}` is replaced with the client's message.
    pub reply_template: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            reply_template: "Thanks for reaching out. We received: \"{content}\". \
                             A consultant will follow up shortly."
                .to_string(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub otel: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            otel: false,
        }
    }
}
