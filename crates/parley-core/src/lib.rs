//! Realtime chat transport and business logic for Parley.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus everything that runs between a
//! socket frame and the store: connection registry, rate limiting, routing,
//! fan-out with acknowledgment tracking, and the read-through cache.
//!
//! It depends only on `parley-types` -- never on `parley-infra` or any
//! database/IO crate.

pub mod auth;
pub mod cache;
pub mod chat;
pub mod realtime;
pub mod repository;

#[cfg(test)]
pub(crate) mod testutil;
