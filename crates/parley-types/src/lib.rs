//! Shared domain types for Parley.
//!
//! This crate contains the types used across the chat transport:
//! sessions, messages, wire envelopes, configuration, and error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, toml.

pub mod chat;
pub mod config;
pub mod envelope;
pub mod error;
