//! Infrastructure layer for Parley.
//!
//! Implements the ports defined in `parley-core`: SQLite storage for chat
//! sessions and messages, the built-in chat backend, and configuration
//! loading.

pub mod backend;
pub mod config;
pub mod sqlite;
