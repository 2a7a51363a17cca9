//! Connection lifecycle of the publisher and subscriber roles
//!
//! The [`ConnectionManager`] owns one [`ConnectionState`] per [`Role`]. It is the
//! only component that moves those states; the publisher and subscriber receive a
//! [`ConnectionHandle`] and never touch the state themselves.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::message_db::{MessageDbClient, MessageDbConfig};
use crate::tracking::error::{ConnectionError, ShutdownError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Last handshake failed; connecting again is allowed
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
        )
    }
}

struct RoleSlot {
    state: watch::Sender<ConnectionState>,
    // Serializes handshakes of one role
    handshake: Mutex<()>,
}

impl RoleSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            handshake: Mutex::new(()),
        }
    }
}

struct Inner {
    config: MessageDbConfig,
    publisher: RoleSlot,
    subscriber: RoleSlot,
}

impl Inner {
    fn slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::Publisher => &self.publisher,
            Role::Subscriber => &self.subscriber,
        }
    }

    fn transition(&self, role: Role, next: ConnectionState) -> bool {
        self.slot(role).state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                info!(role = %role, from = ?*current, to = ?next, "Connection state changed");
                *current = next;
                true
            } else {
                if *current != next {
                    warn!(role = %role, from = ?*current, to = ?next, "Ignoring invalid connection state transition");
                }
                false
            }
        })
    }
}

/// Owns the transport connections of both roles
///
/// Cloning is cheap; clones manage the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: MessageDbConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                publisher: RoleSlot::new(),
                subscriber: RoleSlot::new(),
            }),
        }
    }

    pub fn state(&self, role: Role) -> ConnectionState {
        *self.inner.slot(role).state.borrow()
    }

    /// Observe state changes of one role
    pub fn watch(&self, role: Role) -> watch::Receiver<ConnectionState> {
        self.inner.slot(role).state.subscribe()
    }

    /// Perform a single connection handshake for `role`
    ///
    /// Never retries; see [`connect_with_retry`] for the orchestration-level policy.
    pub async fn connect(&self, role: Role) -> Result<ConnectionHandle, ConnectionError> {
        let slot = self.inner.slot(role);
        let _handshake = slot.handshake.lock().await;

        if *slot.state.borrow() == ConnectionState::Connected {
            return Err(ConnectionError::AlreadyConnected { role });
        }

        self.inner.transition(role, ConnectionState::Connecting);
        info!(role = %role, server = %self.inner.config.redacted(), "Connecting to Message DB");

        match MessageDbClient::new(self.inner.config.clone()).await {
            Ok(client) => {
                self.inner.transition(role, ConnectionState::Connected);
                Ok(ConnectionHandle {
                    role,
                    client,
                    released: Arc::new(AtomicBool::new(false)),
                    owner: Arc::clone(&self.inner),
                })
            }
            Err(source) => {
                self.inner.transition(role, ConnectionState::Failed);
                warn!(role = %role, error = %source, "Connection handshake failed");
                Err(ConnectionError::Handshake { role, source })
            }
        }
    }

    /// Release the connection behind `handle`
    ///
    /// Idempotent: releasing an already released handle (or any of its clones)
    /// succeeds without side effects.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), ShutdownError> {
        if !Arc::ptr_eq(&handle.owner, &self.inner) {
            return Err(ShutdownError {
                role: handle.role,
                reason: "handle was issued by a different connection manager".to_string(),
            });
        }

        if handle.released.swap(true, Ordering::SeqCst) {
            debug!(role = %handle.role, "Connection already released");
            return Ok(());
        }

        handle.client.close();
        self.inner.transition(handle.role, ConnectionState::Disconnected);
        info!(role = %handle.role, "Connection released");

        Ok(())
    }
}

/// Access to one role's connection, issued by [`ConnectionManager::connect`]
#[derive(Clone)]
pub struct ConnectionHandle {
    role: Role,
    client: MessageDbClient,
    released: Arc<AtomicBool>,
    owner: Arc<Inner>,
}

impl ConnectionHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// False once the handle has been passed to [`ConnectionManager::disconnect`]
    pub fn is_connected(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> &MessageDbClient {
        &self.client
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("role", &self.role)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Exponential backoff for repeated connection attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Connect `role`, retrying handshake failures according to `policy`
///
/// Returns the last handshake error once the attempts are used up.
pub async fn connect_with_retry(
    manager: &ConnectionManager,
    role: Role,
    policy: &RetryPolicy,
) -> Result<ConnectionHandle, ConnectionError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match manager.connect(role).await {
            Ok(handle) => {
                if attempt > 1 {
                    info!(role = %role, attempt, "Connected after retry");
                }
                return Ok(handle);
            }
            Err(err @ ConnectionError::AlreadyConnected { .. }) => return Err(err),
            Err(err) if attempt >= max_attempts => {
                error!(role = %role, attempts = attempt, error = %err, "Giving up on connection");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                warn!(
                    role = %role,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Connection attempt failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
