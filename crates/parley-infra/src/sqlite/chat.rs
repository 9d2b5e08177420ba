//! SQLite chat repository implementation.
//!
//! Implements `SessionRepository` and `MessageRepository` from `parley-core`
//! with raw sqlx queries, private Row structs, and the split reader/writer
//! pool. Timestamps are stored as fixed-width RFC 3339 strings with
//! microsecond precision so that `ORDER BY created_at` on the text column is
//! chronological.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use parley_core::repository::{MessageRepository, SessionRepository};
use parley_types::chat::{
    ChatMessage, ChatSession, MessageFilter, MessageStatus, MessageType, SessionFilter,
    SessionStatus, now_micros,
};
use parley_types::error::RepositoryError;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed store for chat sessions and messages.
pub struct SqliteChatRepository {
    pool: DatabasePool,
}

impl SqliteChatRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_messages(
        &self,
        mut query: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                ChatMessageRow::from_row(row)
                    .map_err(map_sqlx)?
                    .into_message()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ChatSessionRow {
    id: String,
    user_id: String,
    client_name: String,
    context: String,
    status: String,
    metadata: String,
    created_at: String,
    updated_at: String,
    last_activity_at: String,
    expires_at: String,
}

impl ChatSessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            client_name: row.try_get("client_name")?,
            context: row.try_get("context")?,
            status: row.try_get("status")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn into_session(self) -> Result<ChatSession, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid session id: {e}")))?;
        let status: SessionStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let metadata: HashMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|e| RepositoryError::Query(format!("invalid session metadata: {e}")))?;

        Ok(ChatSession {
            id,
            user_id: self.user_id,
            client_name: self.client_name,
            context: self.context,
            status,
            metadata,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            last_activity_at: parse_datetime(&self.last_activity_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
        })
    }
}

struct ChatMessageRow {
    id: String,
    session_id: String,
    message_type: String,
    content: String,
    metadata: String,
    status: String,
    created_at: String,
}

impl ChatMessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            message_type: row.try_get("message_type")?,
            content: row.try_get("content")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<ChatMessage, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid message id: {e}")))?;
        let session_id = Uuid::parse_str(&self.session_id)
            .map_err(|e| RepositoryError::Query(format!("invalid session_id: {e}")))?;
        let message_type: MessageType = self
            .message_type
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let status: MessageStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| RepositoryError::Query(format!("invalid message metadata: {e}")))?;

        Ok(ChatMessage {
            id,
            session_id,
            message_type,
            content: self.content,
            metadata,
            status,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Classify a driver error. Busy databases and pool exhaustion are transient.
fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        sqlx::Error::Io(io) => RepositoryError::Unavailable(io.to_string()),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_foreign_key_violation() {
                RepositoryError::Conflict(db.message().to_string())
            } else if matches!(db.code().as_deref(), Some("5") | Some("6")) {
                // SQLITE_BUSY / SQLITE_LOCKED
                RepositoryError::Unavailable(db.message().to_string())
            } else {
                RepositoryError::Query(db.message().to_string())
            }
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn push_paging(query: &mut QueryBuilder<'_, Sqlite>, limit: Option<i64>, offset: Option<i64>) {
    // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
    match (limit, offset) {
        (None, None) => {}
        (limit, offset) => {
            query.push(" LIMIT ").push_bind(limit.unwrap_or(-1).max(-1));
            if let Some(offset) = offset {
                query.push(" OFFSET ").push_bind(offset.max(0));
            }
        }
    }
}

fn metadata_json(metadata: &HashMap<String, String>) -> Result<String, RepositoryError> {
    serde_json::to_string(metadata)
        .map_err(|e| RepositoryError::Query(format!("unserializable metadata: {e}")))
}

// ---------------------------------------------------------------------------
// SessionRepository implementation
// ---------------------------------------------------------------------------

impl SessionRepository for SqliteChatRepository {
    async fn create(&self, session: &ChatSession) -> Result<ChatSession, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chat_sessions (id, user_id, client_name, context, status, metadata, created_at, updated_at, last_activity_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(&session.client_name)
        .bind(&session.context)
        .bind(session.status.to_string())
        .bind(metadata_json(&session.metadata)?)
        .bind(format_datetime(&session.created_at))
        .bind(format_datetime(&session.updated_at))
        .bind(format_datetime(&session.last_activity_at))
        .bind(format_datetime(&session.expires_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        Ok(session.clone())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatSession>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        row.map(|row| ChatSessionRow::from_row(&row).map_err(map_sqlx)?.into_session())
            .transpose()
    }

    async fn update(&self, session: &ChatSession) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chat_sessions
               SET client_name = ?, context = ?, status = ?, metadata = ?,
                   updated_at = ?, last_activity_at = ?, expires_at = ?
               WHERE id = ?"#,
        )
        .bind(&session.client_name)
        .bind(&session.context)
        .bind(session.status.to_string())
        .bind(metadata_json(&session.metadata)?)
        .bind(format_datetime(&session.updated_at))
        .bind(format_datetime(&session.last_activity_at))
        .bind(format_datetime(&session.expires_at))
        .bind(session.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_status(&self, id: &Uuid, status: SessionStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE chat_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(format_datetime(&now_micros()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_activity(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let stamp = format_datetime(&at);
        let result = sqlx::query(
            "UPDATE chat_sessions SET last_activity_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ChatSession>, RepositoryError> {
        SessionRepository::list(
            self,
            &SessionFilter {
                user_id: Some(user_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, RepositoryError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM chat_sessions WHERE 1 = 1");
        if let Some(user_id) = &filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(before) = &filter.idle_before {
            query
                .push(" AND last_activity_at < ")
                .push_bind(format_datetime(before));
        }
        if let Some(before) = &filter.expires_before {
            query
                .push(" AND expires_at <= ")
                .push_bind(format_datetime(before));
        }
        query.push(" ORDER BY last_activity_at DESC, id DESC");
        push_paging(&mut query, filter.limit, filter.offset);

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| ChatSessionRow::from_row(row).map_err(map_sqlx)?.into_session())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MessageRepository implementation
// ---------------------------------------------------------------------------

impl MessageRepository for SqliteChatRepository {
    async fn create(&self, message: &ChatMessage) -> Result<ChatMessage, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chat_messages (id, session_id, message_type, content, search_text, metadata, status, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.message_type.to_string())
        .bind(&message.content)
        .bind(message.content.to_lowercase())
        .bind(message.metadata.to_string())
        .bind(message.status.to_string())
        .bind(format_datetime(&message.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        Ok(message.clone())
    }

    async fn update(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE chat_messages SET content = ?, search_text = ?, metadata = ?, status = ? WHERE id = ?",
        )
        .bind(&message.content)
        .bind(message.content.to_lowercase())
        .bind(message.metadata.to_string())
        .bind(message.status.to_string())
        .bind(message.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM chat_messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        row.map(|row| ChatMessageRow::from_row(&row).map_err(map_sqlx)?.into_message())
            .transpose()
    }

    async fn get_by_session_id(
        &self,
        session_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        // Select the page from the newest end, then flip it back to
        // chronological order.
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM (SELECT * FROM chat_messages WHERE session_id = ",
        );
        query
            .push_bind(session_id.to_string())
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset.max(0))
            .push(") ORDER BY created_at ASC, id ASC");
        self.fetch_messages(query).await
    }

    async fn list(&self, filter: &MessageFilter) -> Result<Vec<ChatMessage>, RepositoryError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM chat_messages WHERE 1 = 1");
        if let Some(session_id) = filter.session_id {
            query
                .push(" AND session_id = ")
                .push_bind(session_id.to_string());
        }
        if let Some(message_type) = filter.message_type {
            query
                .push(" AND message_type = ")
                .push_bind(message_type.to_string());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(since) = &filter.since {
            query
                .push(" AND created_at >= ")
                .push_bind(format_datetime(since));
        }
        if let Some(until) = &filter.until {
            query
                .push(" AND created_at < ")
                .push_bind(format_datetime(until));
        }
        query.push(" ORDER BY created_at ASC, id ASC");
        push_paging(&mut query, filter.limit, filter.offset);
        self.fetch_messages(query).await
    }

    async fn search(
        &self,
        session_id: &Uuid,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut sql =
            QueryBuilder::<Sqlite>::new("SELECT * FROM chat_messages WHERE session_id = ");
        sql.push_bind(session_id.to_string())
            .push(" AND instr(search_text, ")
            .push_bind(query.to_lowercase())
            .push(") > 0 ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit);
        self.fetch_messages(sql).await
    }

    async fn update_status(&self, id: &Uuid, status: MessageStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE chat_messages SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_by_session_id(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn count_by_session(&self, session_id: &Uuid) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM chat_messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        let count: i64 = row.try_get("cnt").map_err(map_sqlx)?;
        Ok(count.max(0) as u64)
    }
}
