//! Event router
//!
//! Static mapping from event type to handler, filled once at startup and
//! shared read-only by every connection's inbound loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::error::AppError;
use crate::message::Event;

/// Business logic for one inbound event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle `event` sent by the connection behind `sender`
    async fn handle(&self, event: &Event, sender: &ConnectionHandle) -> Result<(), AppError>;
}

/// Event type -> handler lookup
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    /// Create a router with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_handler(mut self, kind: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    #[cfg(test)]
    fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Dispatch `event` to its handler
    ///
    /// An unregistered type is an error, never a silent drop.
    pub async fn route(&self, event: &Event, sender: &ConnectionHandle) -> Result<(), AppError> {
        let Some(handler) = self.handlers.get(event.kind()) else {
            return Err(AppError::UnknownEvent(event.kind().to_string()));
        };

        debug!(connection_id = %sender.id(), kind = event.kind(), "Routing event");
        handler.handle(event, sender).await
    }
}
