use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ChatStore, StoreError, UserProfile};
use crate::types::{ChatId, MessageId, UserId};

/// A persisted message row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: String,
    pub created: DateTime<Utc>,
}

/// In-memory store for tests and embedding
///
/// All state sits behind one `Arc<Mutex<_>>` so clones share it. The lock is
/// never held across an await point.
#[derive(Clone, Default)]
pub struct MemoryChatStore {
    inner: Arc<Mutex<MemoryChatStoreInner>>,
}

#[derive(Default)]
struct MemoryChatStoreInner {
    users: HashMap<UserId, UserProfile>,
    /// Chat participants in join order
    chats: HashMap<ChatId, Vec<UserId>>,
    messages: Vec<StoredMessage>,
}

impl MemoryChatStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryChatStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a user profile
    pub fn add_user(&self, id: UserId, username: &str, avatar: &str) {
        let profile = UserProfile {
            id: id.clone(),
            username: username.to_string(),
            avatar: avatar.to_string(),
        };
        self.lock().users.insert(id, profile);
    }

    /// Create a chat with the given participants (duplicates collapse)
    pub fn add_chat(&self, chat_id: ChatId, participants: impl IntoIterator<Item = UserId>) {
        let mut seen = HashSet::new();
        let participants = participants
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();
        self.lock().chats.insert(chat_id, participants);
    }

    /// All persisted messages, oldest first
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.lock().messages.clone()
    }

    /// Number of persisted messages
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn is_user_in_chat(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .chats
            .get(chat_id)
            .is_some_and(|participants| participants.contains(user_id)))
    }

    async fn create_chat_message(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        let mut inner = self.lock();
        if !inner.chats.contains_key(chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", chat_id)));
        }

        let id = MessageId::new();
        inner.messages.push(StoredMessage {
            id,
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            content: content.to_string(),
            created: Utc::now(),
        });
        Ok(id)
    }

    async fn chat_participant_ids(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StoreError> {
        Ok(self.lock().chats.get(chat_id).cloned().unwrap_or_default())
    }

    async fn user_by_id(&self, user_id: &UserId) -> Result<UserProfile, StoreError> {
        self.lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str) -> ChatId {
        ChatId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_membership() {
        let store = MemoryChatStore::new();
        store.add_chat(chat("c1"), [UserId::new("1"), UserId::new("2")]);

        assert!(store.is_user_in_chat(&chat("c1"), &UserId::new("1")).await.unwrap());
        assert!(!store.is_user_in_chat(&chat("c1"), &UserId::new("3")).await.unwrap());
        assert!(!store.is_user_in_chat(&chat("zz"), &UserId::new("1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_message_records_row() {
        let store = MemoryChatStore::new();
        store.add_chat(chat("c1"), [UserId::new("1")]);

        let id = store
            .create_chat_message(&chat("c1"), &UserId::new("1"), "hi")
            .await
            .unwrap();

        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_create_message_unknown_chat() {
        let store = MemoryChatStore::new();
        let result = store
            .create_chat_message(&chat("nope"), &UserId::new("1"), "hi")
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_participants_dedup_and_unknown_chat() {
        let store = MemoryChatStore::new();
        store.add_chat(
            chat("c1"),
            [UserId::new("1"), UserId::new("2"), UserId::new("1")],
        );

        let ids = store.chat_participant_ids(&chat("c1")).await.unwrap();
        assert_eq!(ids, vec![UserId::new("1"), UserId::new("2")]);
        assert!(store.chat_participant_ids(&chat("c2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let store = MemoryChatStore::new();
        store.add_user(UserId::new("1"), "alice", "a.png");

        let profile = store.user_by_id(&UserId::new("1")).await.unwrap();
        assert_eq!(profile.username, "alice");
        assert!(store.user_by_id(&UserId::new("9")).await.is_err());
    }
}
