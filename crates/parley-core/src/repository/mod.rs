//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (parley-infra) implements and that the cache layer decorates. The core
//! crate never depends on any specific storage technology.

pub mod message;
pub mod session;

pub use message::MessageRepository;
pub use session::SessionRepository;
