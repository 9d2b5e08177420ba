//! Persists delivery failures reported by the retry manager.

use std::sync::Arc;

use parley_types::chat::MessageStatus;
use parley_types::error::RepositoryError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::DeliveryFailure;
use crate::repository::MessageRepository;

/// Mark each reported message `failed` until cancelled or the sender side
/// closes.
///
/// A message that no longer exists is skipped. Failures still queued when
/// cancellation arrives are recorded before returning.
pub async fn record_delivery_failures<M: MessageRepository>(
    mut failures: mpsc::UnboundedReceiver<DeliveryFailure>,
    messages: Arc<M>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = failures.recv() => match next {
                Some(failure) => record(messages.as_ref(), &failure).await,
                None => {
                    debug!("Delivery failure channel closed");
                    return;
                }
            },
        }
    }

    while let Ok(failure) = failures.try_recv() {
        record(messages.as_ref(), &failure).await;
    }
    debug!("Delivery failure recorder stopped");
}

async fn record<M: MessageRepository>(messages: &M, failure: &DeliveryFailure) {
    match messages
        .update_status(&failure.message_id, MessageStatus::Failed)
        .await
    {
        Ok(()) => info!(
            message_id = %failure.message_id,
            connection_id = %failure.connection_id,
            session_id = ?failure.session_id,
            attempts = failure.attempts,
            "Message marked failed"
        ),
        Err(RepositoryError::NotFound) => debug!(
            message_id = %failure.message_id,
            "Failed message no longer exists"
        ),
        Err(e) => warn!(
            message_id = %failure.message_id,
            connection_id = %failure.connection_id,
            error = %e,
            "Could not record delivery failure"
        ),
    }
}
