//! Storage collaborator contract
//!
//! The gateway holds no chat state of its own. Membership, participants,
//! profiles and message rows all live behind [`ChatStore`].

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChatId, MessageId, UserId};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryChatStore;
pub use sqlite::SqliteChatStore;

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database directory could not be prepared
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Public profile of a user, as shown next to their messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
}

/// Narrow persistence interface consumed by the send-message handler and
/// the broadcast engine
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Whether `user_id` participates in `chat_id`
    async fn is_user_in_chat(&self, chat_id: &ChatId, user_id: &UserId)
        -> Result<bool, StoreError>;

    /// Persist a message and return its generated identifier
    async fn create_chat_message(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        content: &str,
    ) -> Result<MessageId, StoreError>;

    /// Authoritative participant list of a chat
    ///
    /// An unknown chat yields an empty list.
    async fn chat_participant_ids(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StoreError>;

    /// Load a user's public profile
    async fn user_by_id(&self, user_id: &UserId) -> Result<UserProfile, StoreError>;
}
