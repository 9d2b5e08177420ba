use thiserror::Error;

/// Errors from repository operations (used by trait definitions in parley-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The store is temporarily unavailable (busy, pool timeout, I/O).
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Connection | RepositoryError::Unavailable(_))
    }
}

/// Errors from a cache backend. Never escapes the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache payload serialization failed: {0}")]
    Serialization(String),
}

/// Errors from credential validation at connection time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,
}

/// Errors surfaced by the realtime transport to a connection or caller.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("rate limit exceeded: at most {limit} messages per {window_secs}s")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Store(#[from] RepositoryError),

    #[error("chat backend error: {0}")]
    Backend(String),
}

impl ChatError {
    /// Machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Authentication(_) => "AUTHENTICATION_ERROR",
            ChatError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::Store(e) if e.is_transient() => "STORE_UNAVAILABLE",
            ChatError::Store(_) => "STORE_ERROR",
            ChatError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Unavailable("busy".into()).is_transient());
        assert!(RepositoryError::Connection.is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
    }

    #[test]
    fn test_rate_limit_message_mentions_rate_limit() {
        let err = ChatError::RateLimitExceeded {
            limit: 60,
            window_secs: 60,
        };
        assert!(err.to_string().contains("rate limit exceeded"));
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_store_error_code_reflects_transience() {
        let transient = ChatError::from(RepositoryError::Unavailable("locked".into()));
        assert_eq!(transient.code(), "STORE_UNAVAILABLE");
        let permanent = ChatError::from(RepositoryError::NotFound);
        assert_eq!(permanent.code(), "STORE_ERROR");
    }
}
