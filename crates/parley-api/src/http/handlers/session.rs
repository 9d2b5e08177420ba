//! Session HTTP handlers.
//!
//! Endpoints:
//! - GET /api/v1/sessions/{id}/messages - Page through a session's messages
//! - DELETE /api/v1/sessions/{id} - End a session
//!
//! Both require a bearer token; sessions owned by someone else answer 404.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use parley_core::repository::MessageRepository;
use parley_types::chat::{ChatMessage, ChatSession};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::AuthUser;
use crate::http::response::ApiResponse;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Query parameters for message listing.
#[derive(Debug, Default, Deserialize)]
pub struct MessageListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl MessageListQuery {
    fn paging(&self) -> Result<(i64, i64), AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        let offset = self.offset.unwrap_or(0);
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        if offset < 0 {
            return Err(AppError::Validation("offset must not be negative".to_string()));
        }
        Ok((limit, offset))
    }
}

/// Parse a UUID from a path parameter, returning a 400 error on invalid format.
fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    s.parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("Invalid UUID: {s}")))
}

/// Load a session the caller owns.
async fn owned_session(
    state: &AppState,
    user: &AuthUser,
    sid: Uuid,
) -> Result<ChatSession, AppError> {
    match state.sessions.get_session(&sid).await? {
        Some(session) if session.user_id == user.0.user_id => Ok(session),
        _ => Err(AppError::NotFound(format!("Session {sid} not found"))),
    }
}

/// GET /api/v1/sessions/{id}/messages - Oldest-first page, newest window at offset 0.
///
/// First pages within the cache window are served through the message cache.
pub async fn get_messages(
    user: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessageListQuery>,
) -> Result<ApiResponse<Vec<ChatMessage>>, AppError> {
    let start = Instant::now();
    let sid = parse_uuid(&session_id)?;
    let (limit, offset) = query.paging()?;
    owned_session(&state, &user, sid).await?;

    let messages = state.messages.get_by_session_id(&sid, limit, offset).await?;
    Ok(ApiResponse::success(messages, start)
        .with_link("self", format!("/api/v1/sessions/{sid}/messages?limit={limit}&offset={offset}")))
}

/// DELETE /api/v1/sessions/{id} - Terminate the session.
///
/// Answers 409 when it has already expired or been terminated.
pub async fn end_session(
    user: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<ApiResponse<ChatSession>, AppError> {
    let start = Instant::now();
    let sid = parse_uuid(&session_id)?;
    let session = owned_session(&state, &user, sid).await?;
    if session.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Session {sid} is already {}",
            session.status
        )));
    }

    let ended = state.sessions.end_session(&sid).await?;
    Ok(ApiResponse::success(ended, start)
        .with_link("messages", format!("/api/v1/sessions/{sid}/messages")))
}
