//! Network connectivity observation.
//!
//! The queue never polls the network. Hosts push state changes into an
//! observer and the queue subscribes to them, reacting only to offline to
//! online transitions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

/// A point-in-time view of the device's network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    /// Whether the device currently has network access.
    pub is_connected: bool,
}

impl ConnectivityState {
    /// State for a device with network access.
    #[must_use]
    pub const fn online() -> Self {
        Self { is_connected: true }
    }

    /// State for a device without network access.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            is_connected: false,
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_connected {
            write!(f, "online")
        } else {
            write!(f, "offline")
        }
    }
}

/// Source of connectivity information.
///
/// `subscribe` returns a receiver that observes every state change; dropping
/// the receiver unsubscribes.
#[async_trait]
pub trait ConnectivityObserver: Send + Sync + std::fmt::Debug {
    /// Subscribe to connectivity changes.
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;

    /// Query the current connectivity state on demand.
    async fn fetch_current_state(&self) -> ConnectivityState;
}

/// A [`ConnectivityObserver`] whose state is pushed by the host.
///
/// Platform network callbacks (or tests) call [`ConnectivityHandle::set_connected`];
/// every subscriber sees the change. Clones share the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityHandle {
    /// Create a handle with the given initial state.
    #[must_use]
    pub fn new(is_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState { is_connected });
        Self { tx: Arc::new(tx) }
    }

    /// Push a new connectivity state. Repeating the current state is ignored.
    pub fn set_connected(&self, is_connected: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.is_connected == is_connected {
                false
            } else {
                state.is_connected = is_connected;
                true
            }
        });
        if changed {
            debug!(is_connected, "connectivity changed");
        }
    }

    /// The current state.
    #[must_use]
    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConnectivityObserver for ConnectivityHandle {
    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    async fn fetch_current_state(&self) -> ConnectivityState {
        self.current()
    }
}
