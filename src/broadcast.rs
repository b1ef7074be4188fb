//! Broadcast engine
//!
//! Fans an event out to the live connections of a chat's participants. The
//! participant set always comes from storage; the registry only says who is
//! reachable right now.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{AppError, SendError};
use crate::message::Event;
use crate::registry::ConnectionRegistry;
use crate::store::ChatStore;
use crate::types::ChatId;

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Size of the chat's participant set
    pub participants: usize,
    /// Connections the event was queued on
    pub delivered: usize,
    /// Connections skipped because their queue was full or closed
    pub dropped: usize,
}

/// Resolves participants and enqueues onto their connections
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ChatStore>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn ChatStore>) -> Self {
        Self { registry, store }
    }

    /// Send `event` to every connected participant of `chat_id`
    ///
    /// Best effort and at most once per connection. A full queue drops the
    /// event for that recipient only; disconnected participants get nothing.
    pub async fn broadcast(&self, chat_id: &ChatId, event: Event) -> Result<BroadcastReport, AppError> {
        let participant_ids = self
            .store
            .chat_participant_ids(chat_id)
            .await
            .map_err(AppError::storage("get chat participants"))?;

        let participants: HashSet<_> = participant_ids.iter().collect();
        let recipients = self.registry.snapshot_matching(&participants).await;

        let mut report = BroadcastReport {
            participants: participants.len(),
            ..Default::default()
        };

        for recipient in recipients {
            match recipient.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(SendError::QueueFull) => {
                    warn!(
                        chat_id = %chat_id,
                        connection_id = %recipient.id(),
                        user_id = %recipient.user_id(),
                        "Outbound queue full, dropping event"
                    );
                    report.dropped += 1;
                }
                Err(SendError::ChannelClosed) => report.dropped += 1,
            }
        }

        info!(
            chat_id = %chat_id,
            "Broadcast {} to {} connections ({} participants, {} dropped)",
            event.kind(),
            report.delivered,
            report.participants,
            report.dropped
        );
        Ok(report)
    }
}
