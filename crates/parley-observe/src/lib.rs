//! Observability setup for Parley: tracing subscriber and OpenTelemetry export.

pub mod tracing_setup;
