//! HTTP layer for Parley.
//!
//! The WebSocket upgrade at `/ws/chat`, token-protected session routes and
//! read-only diagnostics under `/api/v1/`, all answering in the envelope
//! response format.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
