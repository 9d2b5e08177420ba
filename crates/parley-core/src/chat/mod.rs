//! Chat sessions and the assistant backend port.

pub mod backend;
pub mod session;

pub use backend::{ChatBackend, ChatReply};
pub use session::{LifecycleSweep, SessionService};
