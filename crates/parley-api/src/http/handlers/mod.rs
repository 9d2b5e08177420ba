//! HTTP and WebSocket handlers.

pub mod diagnostics;
pub mod session;
pub mod ws;
