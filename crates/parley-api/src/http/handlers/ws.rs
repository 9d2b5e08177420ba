//! WebSocket endpoint for realtime chat.
//!
//! `GET /ws/chat` authenticates the caller from `Authorization: Bearer` or
//! the `token` query parameter and answers 401 before upgrading if the
//! credential is missing or invalid. Once upgraded, each connection gets:
//!
//! - **A writer task** that owns the socket sink, drains the connection's
//!   outbound queue, and pings the client every heartbeat interval. It
//!   closes the socket when the pool has evicted the connection.
//! - **A reader loop** that hands every text frame to the
//!   [`MessageRouter`](parley_core::realtime::MessageRouter). Pongs count as
//!   activity, so a responsive client is never swept as idle.
//!
//! Disconnecting unregisters the connection, abandons its pending retries,
//! and tells the rest of the session (or the user's other tabs) that the
//! user went offline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_core::auth::Identity;
use parley_core::realtime::{BroadcastTarget, Connection, ConnectionPool};
use parley_types::envelope::{PresenceStatus, ServerEvent};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::authenticate;
use crate::state::AppState;

/// How long the writer may take to flush queued frames after the reader ends.
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Authenticate, then upgrade. Mounted at `/ws/chat`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let identity = authenticate(state.validator.as_ref(), &headers, query.token.as_deref())?;
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        serve_connection(state, identity, sink, stream).await;
    }))
}

/// Run one authenticated connection until either side goes away.
pub async fn serve_connection<Si, St>(state: AppState, identity: Identity, sink: Si, mut stream: St)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: std::fmt::Display + Send,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = Uuid::now_v7().to_string();
    let (conn, outbound) = Connection::channel(
        connection_id.clone(),
        identity.user_id.clone(),
        state.config.realtime.outbound_buffer,
    );
    let conn = Arc::new(conn);
    state.pool.register(Arc::clone(&conn));
    info!(connection_id = %connection_id, user_id = %identity.user_id, "WebSocket connected");

    let closing = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&state.pool),
        connection_id.clone(),
        state.config.realtime.heartbeat_interval(),
        closing.clone(),
    ));

    let writer_finished = loop {
        tokio::select! {
            _ = &mut writer => break true,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => state.router.route_text(&conn, text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => state.router.route_text(&conn, text).await,
                    Err(_) => debug!(connection_id = %connection_id, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Err(e)) => {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                    break false;
                }
            }
        }
    };

    state.pool.unregister(&connection_id);
    announce_offline(&state, &conn);

    closing.cancel();
    if !writer_finished && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        connection_id = %connection_id,
        user_id = %identity.user_id,
        dropped_frames = conn.drop_count(),
        "WebSocket disconnected"
    );
}

fn announce_offline(state: &AppState, conn: &Connection) {
    let session_id = conn.session_id();
    let target = match session_id {
        Some(id) => BroadcastTarget::Session(id),
        None => BroadcastTarget::User(conn.user_id().to_string()),
    };
    let event = ServerEvent::Presence {
        user_id: conn.user_id().to_string(),
        status: PresenceStatus::Offline,
        session_id,
        timestamp: Utc::now(),
    };
    state.broadcaster.broadcast_event(&target, &event, Some(conn.id()));
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Arc<String>>,
    pool: Arc<ConnectionPool>,
    connection_id: String,
    heartbeat: Duration,
    closing: CancellationToken,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display + Send,
{
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closing.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(Message::Text(frame.as_str().into())).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                if let Err(e) = sink.send(Message::Text(frame.as_str().into())).await {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
                    return;
                }
            }
            _ = ticker.tick() => {
                if pool.get(&connection_id).is_none() {
                    debug!(connection_id = %connection_id, "Connection evicted, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    return;
                }
            }
        }
    }
}
