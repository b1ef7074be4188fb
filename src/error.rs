//! Error types for the chat gateway
//!
//! Defines upgrade rejections, application-level errors and queue send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::store::StoreError;
use crate::types::{ChatId, UserId};

/// Reasons an upgrade request is refused before the protocol switch
///
/// Every variant maps to `401 Unauthorized` in the handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential token in the query string
    #[error("credential token missing")]
    MissingToken,

    /// Token unknown, already consumed, or past its retention window
    #[error("credential token invalid or expired")]
    InvalidToken,

    /// Origin header absent or not on the allow-list
    #[error("origin not allowed: {0:?}")]
    OriginNotAllowed(Option<String>),
}

/// How an error is handled at the loop boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed payload or unknown event type; connection survives
    Protocol,
    /// Request rejected before any side effect
    Validation,
    /// Storage failed; handler aborted, nothing broadcast
    Persistence,
    /// Socket failure; connection terminates
    Transport,
}

/// Application-level errors
///
/// Transport errors end a connection. Everything else is returned from a
/// handler, logged by the inbound loop, and the session continues.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No handler registered for the event type
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    /// Message text was empty
    #[error("Message content cannot be empty")]
    EmptyMessage,

    /// Chat identifier failed to parse
    #[error("Invalid chat ID: {0:?}")]
    InvalidChatId(String),

    /// Sender is not a participant of the chat
    #[error("User {user_id} is not a member of chat {chat_id}")]
    NotChatMember { chat_id: ChatId, user_id: UserId },

    /// Storage collaborator failed during a handler step
    #[error("Failed to {step}: {source}")]
    Storage {
        step: &'static str,
        #[source]
        source: StoreError,
    },
}

impl AppError {
    /// Wrap a storage failure with the step that produced it
    pub fn storage(step: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| AppError::Storage { step, source }
    }

    /// Classify this error for loop-boundary handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::WebSocket(_) => ErrorKind::Transport,
            AppError::Json(_) | AppError::UnknownEvent(_) => ErrorKind::Protocol,
            AppError::EmptyMessage
            | AppError::InvalidChatId(_)
            | AppError::NotChatMember { .. } => ErrorKind::Validation,
            AppError::Storage { .. } => ErrorKind::Persistence,
        }
    }
}

/// Outbound queue send errors
///
/// Enqueue never blocks; these report why an event was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The outbound queue is at capacity; the event was dropped
    #[error("Outbound queue full")]
    QueueFull,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
