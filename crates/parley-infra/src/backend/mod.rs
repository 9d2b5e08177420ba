//! Chat backend implementations.

pub mod canned;

pub use canned::CannedReplyBackend;
