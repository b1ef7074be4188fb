//! SQLite-backed chat store
//!
//! One connection behind a mutex; every query runs on the blocking pool so
//! the async executor is never stalled on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use super::{ChatStore, StoreError, UserProfile};
use crate::types::{ChatId, MessageId, UserId};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        avatar TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        created TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chat_users (
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (chat_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id),
        created TEXT NOT NULL,
        content TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created);
";

/// Chat store persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChatStore {
    /// Create or open a database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_schema(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!("SQLite chat store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }

    /// Insert or replace a user profile
    pub async fn create_user(
        &self,
        id: &UserId,
        username: &str,
        avatar: &str,
    ) -> Result<(), StoreError> {
        let (id, username, avatar) = (id.0.clone(), username.to_string(), avatar.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO users (id, username, avatar) VALUES (?1, ?2, ?3)",
                params![id, username, avatar],
            )?;
            Ok(())
        })
        .await
    }

    /// Create a chat and attach its participants in one transaction
    pub async fn create_chat(
        &self,
        chat_id: &ChatId,
        participants: &[UserId],
    ) -> Result<(), StoreError> {
        let chat_id = chat_id.as_str().to_string();
        let participants: Vec<String> = participants.iter().map(|p| p.0.clone()).collect();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, created) VALUES (?1, ?2)",
                params![chat_id, Utc::now().to_rfc3339()],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO chat_users (chat_id, user_id) VALUES (?1, ?2)",
                )?;
                for user_id in &participants {
                    stmt.execute(params![chat_id, user_id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Content of every message in a chat, oldest first
    #[cfg(test)]
    async fn chat_messages(&self, chat_id: &ChatId) -> Result<Vec<(UserId, String)>, StoreError> {
        let chat_id = chat_id.as_str().to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id, content FROM messages WHERE chat_id = ?1 ORDER BY created, rowid",
            )?;
            let rows = stmt
                .query_map(params![chat_id], |row| {
                    Ok((UserId(row.get(0)?), row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn is_user_in_chat(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        let (chat_id, user_id) = (chat_id.as_str().to_string(), user_id.0.clone());
        self.call(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM chat_users WHERE chat_id = ?1 AND user_id = ?2)",
                params![chat_id, user_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn create_chat_message(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        let id = MessageId::new();
        let (chat_id, user_id, content) = (
            chat_id.as_str().to_string(),
            user_id.0.clone(),
            content.to_string(),
        );
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, user_id, created, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.0.to_string(), chat_id, user_id, Utc::now().to_rfc3339(), content],
            )?;
            Ok(id)
        })
        .await
    }

    async fn chat_participant_ids(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StoreError> {
        let chat_id = chat_id.as_str().to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT user_id FROM chat_users WHERE chat_id = ?1")?;
            let ids = stmt
                .query_map(params![chat_id], |row| row.get::<_, String>(0).map(UserId))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn user_by_id(&self, user_id: &UserId) -> Result<UserProfile, StoreError> {
        let id = user_id.0.clone();
        self.call(move |conn| {
            conn.query_row(
                "SELECT username, avatar FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserProfile {
                        id: UserId(id.clone()),
                        username: row.get(0)?,
                        avatar: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))
        })
        .await
    }
}
