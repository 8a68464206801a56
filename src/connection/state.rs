//! Connection state, the pure transition function, and the observable store
//!
//! The store is the only piece of the manager the UI reads. Listeners are
//! called synchronously, in registration order, after the snapshot has been
//! replaced. A notification that has been overtaken by a newer snapshot is
//! dropped, so listeners never see states out of order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const AUTHENTICATION_FAILED: &str = "Authentication failed";
pub const RECONNECTION_FAILED: &str = "Reconnection failed";
pub const TOKEN_UNAVAILABLE: &str = "No authentication token available";

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticated,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Authenticated => "AUTHENTICATED",
            ConnectionStatus::Error => "ERROR",
        }
    }

    /// True while a connect is pending or established
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Authenticated
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{status, error}` as observed by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: None,
        }
    }

    pub fn connecting() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            error: None,
        }
    }

    pub fn authenticated() -> Self {
        Self {
            status: ConnectionStatus::Authenticated,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            error: Some(message.into()),
        }
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `connect()` called
    ConnectRequested,
    /// Transport handshake accepted
    TransportConnected,
    /// Transport dropped the connection
    TransportDisconnected,
    /// Explicit `disconnect()` or `cleanup()`
    TeardownRequested,
    /// Transient failure; the transport keeps reconnecting
    NetworkError(String),
    /// Credentials rejected outright
    AuthRejected(String),
    /// Token refresh gave up
    AuthenticationFailed,
    /// Transport exhausted its own reconnection attempts
    ReconnectionExhausted,
    /// No token could be obtained for connect
    TokenUnavailable,
    /// Endpoint or transport could not be set up
    SetupFailed(String),
}

/// Pure transition function
pub fn next_state(current: &ConnectionSnapshot, event: &LifecycleEvent) -> ConnectionSnapshot {
    match event {
        LifecycleEvent::ConnectRequested => {
            if current.status.is_active() {
                current.clone()
            } else {
                ConnectionSnapshot::connecting()
            }
        }
        LifecycleEvent::TransportConnected => ConnectionSnapshot::authenticated(),
        LifecycleEvent::TransportDisconnected | LifecycleEvent::TeardownRequested => {
            ConnectionSnapshot::disconnected()
        }
        LifecycleEvent::NetworkError(message)
        | LifecycleEvent::AuthRejected(message)
        | LifecycleEvent::SetupFailed(message) => ConnectionSnapshot::error(message.clone()),
        LifecycleEvent::AuthenticationFailed => ConnectionSnapshot::error(AUTHENTICATION_FAILED),
        LifecycleEvent::ReconnectionExhausted => ConnectionSnapshot::error(RECONNECTION_FAILED),
        LifecycleEvent::TokenUnavailable => ConnectionSnapshot::error(TOKEN_UNAVAILABLE),
    }
}

/// Log a state transition
pub fn log_transition(from: &ConnectionSnapshot, to: &ConnectionSnapshot) {
    match (from.status, to.status) {
        (ConnectionStatus::Connecting, ConnectionStatus::Authenticated) => {
            info!("Realtime connection authenticated");
        }
        (ConnectionStatus::Authenticated, ConnectionStatus::Disconnected) => {
            warn!("Realtime connection lost");
        }
        (_, ConnectionStatus::Error) => {
            error!(
                error = to.error.as_deref().unwrap_or_default(),
                "Realtime connection error"
            );
        }
        _ => {
            info!("Realtime connection state: {} -> {}", from.status, to.status);
        }
    }
}

/// Callback notified with every new snapshot
pub type StateListener = Arc<dyn Fn(&ConnectionSnapshot) + Send + Sync>;

struct StoreInner {
    snapshot: ConnectionSnapshot,
    /// Bumped on every published change
    version: u64,
    listeners: Vec<(u64, StateListener)>,
    next_id: u64,
}

/// A published snapshot whose listeners have not been called yet
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct StateNotification {
    version: u64,
    snapshot: ConnectionSnapshot,
}

/// Observable holder of the current [`ConnectionSnapshot`]
pub struct ConnectionStateStore {
    inner: Arc<Mutex<StoreInner>>,
    watch_tx: watch::Sender<ConnectionSnapshot>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionSnapshot::disconnected());
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                snapshot: ConnectionSnapshot::disconnected(),
                version: 0,
                listeners: Vec::new(),
                next_id: 0,
            })),
            watch_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.lock().snapshot.clone()
    }

    /// Replace the snapshot and notify listeners if it changed
    pub fn set(&self, snapshot: ConnectionSnapshot) {
        if let Some(notification) = self.publish(snapshot) {
            self.notify(notification);
        }
    }

    /// Replace the snapshot without calling listeners
    ///
    /// Callers that serialize their own transitions publish under their lock,
    /// so the stored snapshot always follows the order of those transitions,
    /// and hand the result to [`notify`](Self::notify) once unlocked.
    pub fn publish(&self, snapshot: ConnectionSnapshot) -> Option<StateNotification> {
        let mut inner = self.lock();
        if inner.snapshot == snapshot {
            return None;
        }
        log_transition(&inner.snapshot, &snapshot);
        inner.snapshot = snapshot.clone();
        inner.version += 1;
        self.watch_tx.send_replace(snapshot.clone());
        Some(StateNotification {
            version: inner.version,
            snapshot,
        })
    }

    /// Call listeners for a published snapshot
    ///
    /// Skipped if a newer snapshot has been published since; that one is
    /// delivered by its own notification.
    pub fn notify(&self, notification: StateNotification) {
        let listeners: Vec<StateListener> = {
            let inner = self.lock();
            if inner.version != notification.version {
                return;
            }
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(&notification.snapshot);
        }
    }

    pub fn subscribe(&self, listener: StateListener) -> StateSubscription {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, listener));
        StateSubscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receiver for async consumers; starts at the current snapshot
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.watch_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn clear_listeners(&self) {
        self.lock().listeners.clear();
    }
}

/// Handle returned by [`ConnectionStateStore::subscribe`]
///
/// Unsubscribing is idempotent; dropping the handle keeps the listener.
#[derive(Debug)]
pub struct StateSubscription {
    store: Weak<Mutex<StoreInner>>,
    id: u64,
}

impl StateSubscription {
    pub fn unsubscribe(&self) {
        if let Some(store) = self.store.upgrade() {
            let mut inner = store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
