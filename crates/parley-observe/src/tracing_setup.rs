//! Global subscriber for Parley: an `EnvFilter`, a text or JSON `fmt` layer,
//! and an optional OpenTelemetry bridge exporting spans to stdout.
//!
//! ```no_run
//! use parley_observe::tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
//!
//! init_tracing("info", LogFormat::Json, false).unwrap();
//! tracing::info!(connection_id = "c-1", "connected");
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

const TRACER_NAME: &str = "parley";

static OTEL_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Line format of the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        match self {
            Self::Text => base.boxed(),
            Self::Json => base.json().boxed(),
        }
    }
}

/// `RUST_LOG` when set and parseable, else `default_level`, else `info`.
pub fn filter_from(env: Option<&str>, default_level: &str) -> EnvFilter {
    env.filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn otel_provider() -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    if OTEL_PROVIDER.set(provider.clone()).is_err() {
        tracing::debug!("OpenTelemetry provider already registered");
    }
    opentelemetry::global::set_tracer_provider(provider.clone());
    provider
}

/// Install the process-wide subscriber.
///
/// Fails when a global subscriber is already set.
pub fn init_tracing(
    default_level: &str,
    format: LogFormat,
    enable_otel: bool,
) -> Result<(), TryInitError> {
    let otel = enable_otel.then(|| {
        let tracer = otel_provider().tracer(TRACER_NAME);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });
    let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref(), default_level);

    tracing_subscriber::registry()
        .with(format.layer())
        .with(otel)
        .with(filter)
        .try_init()
}

/// Flush and stop the OpenTelemetry exporter; a no-op when it never started.
pub fn shutdown_tracing() {
    let Some(provider) = OTEL_PROVIDER.get() else {
        return;
    };
    if let Err(e) = provider.shutdown() {
        eprintln!("OpenTelemetry shutdown failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_used_without_env() {
        assert_eq!(filter_from(None, "warn").to_string(), "warn");
        assert_eq!(filter_from(Some("  "), "debug").to_string(), "debug");
    }

    #[test]
    fn test_env_takes_precedence() {
        assert_eq!(
            filter_from(Some("parley_core=debug"), "info").to_string(),
            "parley_core=debug"
        );
    }

    #[test]
    fn test_format_from_flag() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Text);
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown_tracing();
    }
}
