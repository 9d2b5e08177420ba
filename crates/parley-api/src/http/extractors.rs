//! Bearer-token authentication shared by the REST routes and the WebSocket
//! upgrade.
//!
//! REST callers must send `Authorization: Bearer <jwt>`. The WebSocket
//! upgrade also accepts the token as a query parameter, because browsers
//! cannot set headers on a socket handshake.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use parley_core::auth::{Identity, TokenValidator, bearer_token};
use parley_types::error::AuthError;
use tracing::warn;

use crate::http::error::AppError;
use crate::state::AppState;

/// Resolve the caller's identity. The header wins over the query parameter.
pub fn authenticate(
    validator: &dyn TokenValidator,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identity, AppError> {
    let token = match headers.get(AUTHORIZATION) {
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                AuthError::InvalidToken("invalid Authorization header encoding".to_string())
            })?;
            bearer_token(value)?
        }
        None => query_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?,
    };

    validator.validate(token).map_err(|e| {
        warn!(error = %e, "Rejected credentials");
        AppError::Auth(e)
    })
}

/// The authenticated caller of a REST route. Extraction fails with 401.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authenticate(state.validator.as_ref(), &parts.headers, None).map(AuthUser)
    }
}
