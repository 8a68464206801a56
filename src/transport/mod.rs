//! Transport layer for the realtime channel
//!
//! This module defines the seam between the connection manager and the
//! bidirectional transport library. The manager only ever talks to a
//! [`Transport`] created by a [`TransportFactory`], and the transport reports
//! back through an [`EventSink`] bound to one connect cycle.

use crate::config::{ClientType, Platform, TransportSection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "socketio")]
pub mod socketio;

/// Credential bundle presented on connect and swapped in place on refresh
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub token: String,
    pub client_type: ClientType,
    pub platform: Platform,
}

impl AuthContext {
    pub fn new(token: impl Into<String>, client_type: ClientType, platform: Platform) -> Self {
        Self {
            token: token.into(),
            client_type,
            platform,
        }
    }

    /// Handshake payload in the shape the server expects
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "token": self.token,
            "clientType": self.client_type,
            "platform": self.platform,
        })
    }
}

// Tokens must never end up in logs
impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &"***")
            .field("client_type", &self.client_type)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Options the transport is constructed with
///
/// Reconnection after network loss is delegated to the transport itself; the
/// manager only turns it off when authentication can no longer succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Allowed mechanisms, restricted to one
    pub transports: Vec<String>,
    /// Always false: the manager issues `open` explicitly
    pub auto_connect: bool,
    pub reconnection: bool,
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    pub reconnection_delay_max: Duration,
    pub timeout: Duration,
    pub auth: AuthContext,
}

impl TransportOptions {
    pub fn from_section(section: &TransportSection, auth: AuthContext) -> Self {
        Self {
            transports: section.transports.clone(),
            auto_connect: false,
            reconnection: section.reconnection,
            reconnection_attempts: section.reconnection_attempts,
            reconnection_delay: Duration::from_millis(section.reconnection_delay_ms),
            reconnection_delay_max: Duration::from_millis(section.reconnection_delay_max_ms),
            timeout: Duration::from_millis(section.timeout_ms),
            auth,
        }
    }
}

/// Lifecycle and message events reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake accepted (initial connect or automatic reconnect)
    Connected { socket_id: Option<String> },
    /// Connection dropped; the transport may reconnect on its own
    Disconnected { reason: String },
    /// Handshake or connection failure
    ConnectError { message: String },
    /// The transport gave up reconnecting
    ReconnectFailed,
    /// Server-sent event
    Message { event: String, payload: Value },
}

/// Callback a transport uses to report [`TransportEvent`]s
///
/// Implementations must not call the sink while holding a lock that
/// [`Transport`] methods also take.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Transport errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Failed to open connection: {0}")]
    OpenFailed(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Failed to emit '{event}': {reason}")]
    EmitFailed { event: String, reason: String },
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

/// A single live bidirectional connection
///
/// Methods other than `open` are synchronous and must not block; they may be
/// called while the manager holds its internal lock, so they must never call
/// back into the manager.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue the connect; completion is reported through the event sink
    async fn open(&self) -> Result<(), TransportError>;

    /// Send an event to the server
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Replace the credentials used by this transport without reconnecting
    fn set_auth(&self, auth: AuthContext);

    /// Stop any further automatic reconnection attempts
    fn disable_reconnection(&self);

    /// Close the connection and drop all transport-level listeners
    fn close(&self);

    /// Server-assigned connection id, if connected
    fn socket_id(&self) -> Option<String>;
}

/// Creates transports; the manager creates one per connect cycle
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    fn create(
        &self,
        endpoint: &str,
        options: TransportOptions,
        sink: EventSink,
    ) -> Result<Self::Transport, TransportError>;
}
