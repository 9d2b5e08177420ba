//! Cache key scheme.
//!
//! | key                                   | value                         |
//! |---------------------------------------|-------------------------------|
//! | `parley:session:{id}`                 | one `ChatSession`             |
//! | `parley:messages:{session_id}`        | newest window of a session    |
//! | `parley:message:{id}`                 | one `ChatMessage`             |
//! | `parley:user_sessions:{user_id}`      | a user's sessions             |
//! | `parley:search:{session_id}:{digest}` | one search result page        |

use sha2::{Digest, Sha256};
use uuid::Uuid;

const PREFIX: &str = "parley";

pub fn session(id: &Uuid) -> String {
    format!("{PREFIX}:session:{id}")
}

pub fn session_messages(session_id: &Uuid) -> String {
    format!("{PREFIX}:messages:{session_id}")
}

pub fn message(id: &Uuid) -> String {
    format!("{PREFIX}:message:{id}")
}

pub fn user_sessions(user_id: &str) -> String {
    format!("{PREFIX}:user_sessions:{user_id}")
}

/// Prefix shared by every cached search of one session.
pub fn search_prefix(session_id: &Uuid) -> String {
    format!("{PREFIX}:search:{session_id}:")
}

/// Search results are keyed by a digest so arbitrary query text never ends
/// up in a key.
///
/// The digest covers the lowercased query and nothing else is normalized:
/// stores match case-insensitively, so only queries that fold to the same
/// needle may share an entry.
pub fn search(session_id: &Uuid, query: &str, limit: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(limit.to_le_bytes());
    hasher.update(query.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{}{hex}", search_prefix(session_id))
}
