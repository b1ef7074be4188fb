//! Upgrade gateway
//!
//! Accepts TCP connections, checks the one-time credential and the `Origin`
//! header inside the WebSocket handshake, and only then switches protocols,
//! builds a connection actor for the credential's user and registers it.
//! Rejected requests get `401 Unauthorized` and never become connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, Keepalive};
use crate::credential::{Credential, CredentialRegistry};
use crate::error::{AppError, AuthError};
use crate::handler::SendMessageHandler;
use crate::message::EVENT_SEND_MESSAGE;
use crate::registry::ConnectionRegistry;
use crate::router::EventRouter;
use crate::store::ChatStore;

/// Entry point for client connections
pub struct Gateway {
    credentials: Arc<CredentialRegistry>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
    allowed_origins: HashSet<String>,
    token_param: String,
    keepalive: Keepalive,
    outbound_capacity: usize,
    ws_config: WebSocketConfig,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Gateway {
    /// Wire the registries, router and handlers for `store`
    pub fn new(config: &Config, store: Arc<dyn ChatStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), store.clone()));
        let router = EventRouter::new().with_handler(
            EVENT_SEND_MESSAGE,
            Arc::new(SendMessageHandler::new(store, broadcaster)),
        );

        let max_size = config.connection.max_message_size;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_size);
        ws_config.max_frame_size = Some(max_size);

        Self {
            credentials: Arc::new(CredentialRegistry::new(config.credentials.retention())),
            registry,
            router: Arc::new(router),
            allowed_origins: config.server.allowed_origins.iter().cloned().collect(),
            token_param: config.server.token_param.clone(),
            keepalive: config.connection.keepalive(),
            outbound_capacity: config.connection.outbound_capacity,
            ws_config,
            sweep_interval: config.credentials.sweep_interval(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Credential registry, for the auth collaborator to issue tokens
    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.credentials
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting, stop the sweep and close every connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called
    ///
    /// Returns once every connection task has finished.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let sweeper = self
            .credentials
            .spawn_sweeper(self.sweep_interval, self.shutdown.child_token());

        if let Ok(addr) = listener.local_addr() {
            info!("Gateway accepting connections on {}", addr);
        }

        // Connection accept loop
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        let gateway = Arc::clone(&self);
                        self.tasks.spawn(async move {
                            if let Err(e) = gateway.handle_connection(stream, addr.to_string()).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        info!("Gateway shutting down");
        self.registry.close_all().await;
        self.tasks.close();
        self.tasks.wait().await;
        if let Err(e) = sweeper.await {
            error!("Credential sweep task failed: {}", e);
        }
    }

    /// Run the handshake on `stream` and, if authorized, the connection actor
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: String) -> Result<(), AppError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut credential = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match self.authorize(req) {
                Ok(verified) => {
                    credential = Some(verified);
                    Ok(response)
                }
                Err(e) => {
                    warn!(peer = %peer, "Upgrade rejected: {}", e);
                    Err(unauthorized())
                }
            }
        };

        // A peer that never finishes the handshake must not hold up shutdown
        let handshake =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(self.ws_config));
        let result = match time::timeout(self.keepalive.pong_wait, handshake).await {
            Ok(result) => result,
            Err(_) => {
                debug!(peer = %peer, "Handshake timed out");
                return Ok(());
            }
        };
        let (ws, credential) = match (result, credential) {
            (Ok(ws), Some(credential)) => (ws, credential),
            (Err(e), Some(_)) => return Err(e.into()),
            // Rejected in the callback (already logged) or not a valid handshake
            (Ok(_), None) => return Ok(()),
            (Err(e), None) => {
                debug!(peer = %peer, "Handshake ended without upgrade: {}", e);
                return Ok(());
            }
        };

        let (handle, outbound) = ConnectionHandle::with_shutdown(
            credential.user_id().clone(),
            self.outbound_capacity,
            self.shutdown.child_token(),
        );
        self.registry.register(handle.clone()).await;
        info!(
            peer = %peer,
            connection_id = %handle.id(),
            user_id = %handle.user_id(),
            credential_age = ?credential.issued_at().elapsed(),
            "Connection upgraded"
        );

        Connection::new(
            ws,
            handle,
            outbound,
            Arc::downgrade(&self.registry),
            Arc::clone(&self.router),
            self.keepalive,
        )
        .run()
        .await;

        Ok(())
    }

    /// Check an upgrade request
    ///
    /// The token must be present, the origin allowed, and only then is the
    /// token consumed, so a request from a foreign origin does not burn it.
    pub fn authorize(&self, req: &Request) -> Result<Credential, AuthError> {
        let token = query_param(req.uri().query(), &self.token_param)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let origin = req
            .headers()
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok());
        match origin {
            Some(origin) if self.allowed_origins.contains(origin) => {}
            _ => return Err(AuthError::OriginNotAllowed(origin.map(String::from))),
        }

        self.credentials
            .verify(token)
            .ok_or(AuthError::InvalidToken)
    }
}

/// Value of `name` in a raw query string
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let mut it = pair.splitn(2, '=');
        let key = it.next()?;
        (key == name).then(|| it.next().unwrap_or(""))
    })
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
