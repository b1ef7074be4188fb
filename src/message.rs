//! Message protocol definitions
//!
//! Every frame in either direction is a JSON envelope
//! `{"type": <string>, "payload": <type-specific>}`. The envelope keeps the
//! payload undecoded; each handler decodes the shape it expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::types::{ChatId, MessageId, UserId};

/// Inbound: client posts a message to a chat
pub const EVENT_SEND_MESSAGE: &str = "send_message";
/// Outbound: a message was persisted and is being fanned out
pub const EVENT_NEW_MESSAGE: &str = "new_message";
/// Outbound: the sender's previous request failed
pub const EVENT_ERROR: &str = "error";

/// Wire envelope
///
/// Immutable once built; inbound and outbound traffic share the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Event {
    /// Build an envelope by serializing `payload`
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, AppError> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode an envelope from a text or binary frame
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload as the type-specific structure
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, AppError> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of `send_message`
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: String,
    pub message: String,
}

/// Snapshot of the sender's public profile at send time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSnapshot {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
}

/// Payload of `new_message`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessagePayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub content: String,
    pub sender: SenderSnapshot,
    pub created: DateTime<Utc>,
}

/// Error codes for the `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Envelope or payload could not be decoded
    InvalidMessage,
    /// No handler for the event type
    UnknownEvent,
    /// Message text was empty
    EmptyMessage,
    /// Chat identifier malformed
    InvalidChatId,
    /// Sender does not participate in the chat
    NotChatMember,
    /// Storage or other server-side failure
    Internal,
}

/// Payload of `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Convert AppError to an error payload for client notification
impl From<&AppError> for ErrorPayload {
    fn from(err: &AppError) -> Self {
        let (code, message) = match err {
            AppError::Json(e) => (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e)),
            AppError::UnknownEvent(kind) => {
                (ErrorCode::UnknownEvent, format!("Unknown event type '{}'", kind))
            }
            AppError::EmptyMessage => (ErrorCode::EmptyMessage, err.to_string()),
            AppError::InvalidChatId(_) => (ErrorCode::InvalidChatId, err.to_string()),
            AppError::NotChatMember { .. } => {
                (ErrorCode::NotChatMember, "You are not a member of this chat".to_string())
            }
            // Storage and transport details stay in the server log
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ErrorPayload { code, message }
    }
}

impl Event {
    /// Build the `error` event answering a failed request
    pub fn error(err: &AppError) -> Self {
        let payload = ErrorPayload::from(err);
        Self {
            kind: EVENT_ERROR.to_string(),
            payload: serde_json::json!({
                "code": payload.code,
                "message": payload.message,
            }),
        }
    }
}
