//! One-time credential registry
//!
//! The auth collaborator calls [`CredentialRegistry::issue`] once a user has
//! logged in; the upgrade gateway consumes the token with
//! [`CredentialRegistry::verify`]. A background sweep evicts tokens nobody
//! redeemed so the store cannot grow without bound.
//!
//! Issue, verify and sweep run on independent tasks and all go through one
//! mutex. The lock is never held across an await point, which also lets the
//! synchronous handshake callback verify tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::UserId;

/// Length of a generated token
const TOKEN_LEN: usize = 32;

/// A single-use authorization for one connection upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    user_id: UserId,
    issued_at: Instant,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) > retention
    }
}

/// Expiring store of issued credentials
#[derive(Debug)]
pub struct CredentialRegistry {
    credentials: Mutex<HashMap<String, Credential>>,
    retention: Duration,
}

impl CredentialRegistry {
    /// Create an empty registry whose tokens live for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            credentials: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Credential>> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh credential for `user_id`
    pub fn issue(&self, user_id: UserId) -> Credential {
        let mut credentials = self.lock();

        // Generate unique token
        let token = loop {
            let token = generate_token();
            if !credentials.contains_key(&token) {
                break token;
            }
        };

        let credential = Credential {
            token: token.clone(),
            user_id,
            issued_at: Instant::now(),
        };
        credentials.insert(token, credential.clone());

        debug!(user_id = %credential.user_id, "Issued credential");
        credential
    }

    /// Consume a token
    ///
    /// Lookup and removal happen under one lock, so a token verifies at most
    /// once. A token past its retention window is rejected even if the sweep
    /// has not reached it yet.
    pub fn verify(&self, token: &str) -> Option<Credential> {
        let credential = self.lock().remove(token)?;

        if credential.is_expired(Instant::now(), self.retention) {
            debug!(user_id = %credential.user_id, "Rejected expired credential");
            return None;
        }

        debug!(user_id = %credential.user_id, "Consumed credential");
        Some(credential)
    }

    /// Evict every credential older than the retention window
    ///
    /// Returns the number of credentials removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut credentials = self.lock();
        let before = credentials.len();
        credentials.retain(|_, c| !c.is_expired(now, self.retention));
        before - credentials.len()
    }

    /// Number of outstanding credentials
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the retention sweep every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_expired();
                        if evicted > 0 {
                            debug!(evicted, "Swept expired credentials");
                        }
                    }
                }
            }

            info!("Credential sweep stopped");
        })
    }
}

/// Generate a random alphanumeric token
fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
