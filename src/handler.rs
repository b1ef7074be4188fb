//! Inbound event handlers
//!
//! `send_message` runs strictly in order: validate, check membership,
//! persist, load the sender profile, then broadcast. Any failure aborts the
//! remaining steps, so a non-member never persists anything and nothing is
//! broadcast unless the message row exists.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::connection::ConnectionHandle;
use crate::error::AppError;
use crate::message::{
    Event, NewMessagePayload, SendMessagePayload, SenderSnapshot, EVENT_NEW_MESSAGE,
};
use crate::router::EventHandler;
use crate::store::ChatStore;
use crate::types::ChatId;

/// Handler for `send_message`
pub struct SendMessageHandler {
    store: Arc<dyn ChatStore>,
    broadcaster: Arc<Broadcaster>,
}

impl SendMessageHandler {
    pub fn new(store: Arc<dyn ChatStore>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }
}

#[async_trait]
impl EventHandler for SendMessageHandler {
    async fn handle(&self, event: &Event, sender: &ConnectionHandle) -> Result<(), AppError> {
        let request: SendMessagePayload = event.decode()?;

        if request.message.is_empty() {
            return Err(AppError::EmptyMessage);
        }

        let chat_id = ChatId::parse(&request.chat_id)?;
        let user_id = sender.user_id();

        let is_member = self
            .store
            .is_user_in_chat(&chat_id, user_id)
            .await
            .map_err(AppError::storage("verify chat membership"))?;
        if !is_member {
            return Err(AppError::NotChatMember {
                chat_id,
                user_id: user_id.clone(),
            });
        }

        let message_id = self
            .store
            .create_chat_message(&chat_id, user_id, &request.message)
            .await
            .map_err(AppError::storage("save message"))?;

        let profile = self
            .store
            .user_by_id(user_id)
            .await
            .map_err(AppError::storage("get sender info"))?;

        let payload = NewMessagePayload {
            chat_id: chat_id.clone(),
            message_id,
            content: request.message,
            sender: SenderSnapshot {
                id: profile.id,
                username: profile.username,
                avatar: profile.avatar,
            },
            created: Utc::now(),
        };
        let outbound = Event::new(EVENT_NEW_MESSAGE, &payload)?;

        self.broadcaster.broadcast(&chat_id, outbound).await?;

        info!(
            chat_id = %chat_id,
            message_id = %message_id,
            user_id = %user_id,
            "Message sent by {}", payload.sender.username
        );
        Ok(())
    }
}
