//! Realtime connection management
//!
//! This module keeps one authenticated bidirectional channel alive across
//! network flaps and token expiry, and exposes a stable pub/sub surface.
//!
//! # Architecture
//!
//! Leaf modules hold pure logic; the manager is the only place with I/O:
//!
//! - [`policy`] - Token-refresh backoff and connect-error classification
//! - [`rooms`] - Room identifiers, join/leave command shapes, room registry
//! - [`handlers`] - Event handler registry and subscriptions
//! - [`state`] - Connection state machine and the observable state store
//! - [`manager`] - Lifecycle orchestration and the public API
//!
//! # Usage
//!
//! ```rust,no_run
//! use realtime_link::connection::{handler, ConnectionManager, ConnectionSettings};
//! use realtime_link::endpoint::FixedEndpoint;
//! use realtime_link::testing::{MockTokenProvider, MockTransportFactory};
//! use realtime_link::token::TokenGateway;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let manager = ConnectionManager::new(
//!     MockTransportFactory::new(),
//!     Arc::new(FixedEndpoint::new("wss://api.example.com")),
//!     TokenGateway::new(Arc::new(MockTokenProvider::new(Some("token")))),
//!     ConnectionSettings::default(),
//! );
//!
//! manager.connect(None).await?;
//! manager.join_room("chat", "42");
//! let _subscription = manager.on("chat:message", handler(|payload| println!("{payload}")));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod handlers;
pub mod manager;
pub mod policy;
pub mod rooms;
pub mod state;

pub use handlers::{handler, EventHandler, HandlerRegistry, HandlerSubscription};
pub use manager::{
    ConnectionInfo, ConnectionManager, ConnectionSettings, SOCKET_CONNECTED, SOCKET_DISCONNECTED,
    SOCKET_ERROR,
};
pub use policy::{ConnectErrorKind, ReconnectionPolicy, RetryDecision};
pub use rooms::{Room, RoomCommand, RoomRegistry};
pub use state::{
    next_state, ConnectionSnapshot, ConnectionStateStore, ConnectionStatus, LifecycleEvent,
    StateListener, StateSubscription,
};
