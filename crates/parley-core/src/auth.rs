//! Credential validation port.
//!
//! The transport never inspects tokens itself; the API layer supplies a
//! validator (JWT in production) and the upgrade handler rejects the
//! connection before any socket is opened if validation fails.

use parley_types::error::AuthError;

/// The authenticated principal behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

/// Validates a bearer credential presented at connect time.
pub trait TokenValidator: Send + Sync {
    /// Resolve `token` to an identity, or explain why it is not acceptable.
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Extract the credential from an `Authorization: Bearer` header value.
pub fn bearer_token(header: &str) -> Result<&str, AuthError> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| AuthError::InvalidToken("expected a Bearer token".to_string()))?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token("Bearer abc.def").unwrap(), "abc.def");
        assert_eq!(bearer_token("bearer xyz").unwrap(), "xyz");
        assert_eq!(bearer_token("Bearer   ").unwrap_err(), AuthError::MissingToken);
        assert!(matches!(
            bearer_token("Basic dXNlcg=="),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
