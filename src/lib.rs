//! Real-time chat gateway library
//!
//! A WebSocket transport for chat built with tokio-tungstenite. Clients
//! redeem a one-time credential to upgrade, each connection runs as a small
//! actor, and new messages are fanned out to the connected participants of
//! a chat.
//!
//! # Features
//! - Single-use, time-bounded upgrade credentials with a background sweep
//! - Origin allow-list checked during the handshake
//! - Per-connection reader/writer tasks with ping/pong keepalive
//! - Bounded outbound queues; one writer per socket
//! - Event routing by `type` to async handlers
//! - Participant fan-out resolved from storage, never from live connections
//!
//! # Architecture
//! - `Gateway` authorizes and upgrades connections, then registers them
//! - `ConnectionRegistry` is the only shared mutable state (behind a `RwLock`)
//! - `EventRouter` maps event types to `EventHandler`s
//! - `Broadcaster` asks the `ChatStore` for participants and enqueues onto
//!   their `ConnectionHandle`s
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_gateway::{Config, Gateway, MemoryChatStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(&config.server.addr).await.unwrap();
//!     let gateway = Arc::new(Gateway::new(&config, Arc::new(MemoryChatStore::new())));
//!
//!     // The auth component hands this token to the logged-in user
//!     let credential = gateway.credentials().issue("42".into());
//!
//!     gateway.serve(listener).await;
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod message;
pub mod registry;
pub mod router;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionHandle, Keepalive};
pub use credential::{Credential, CredentialRegistry};
pub use error::{AppError, AuthError, ErrorKind, SendError};
pub use gateway::Gateway;
pub use handler::SendMessageHandler;
pub use message::{ErrorCode, Event, NewMessagePayload, SendMessagePayload, SenderSnapshot};
pub use registry::ConnectionRegistry;
pub use router::{EventHandler, EventRouter};
pub use store::{ChatStore, MemoryChatStore, SqliteChatStore, StoreError, UserProfile};
pub use types::{ChatId, ConnectionId, MessageId, UserId};
