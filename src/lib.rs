//! Realtime Link - authenticated realtime connection manager
//!
//! Keeps a single persistent, authenticated, bidirectional event channel
//! between a client and a server alive across network flaps and token expiry,
//! and exposes a stable pub/sub surface to the rest of the application.
//!
//! # Overview
//!
//! - [`connection`] - connection manager, state store, room and handler registries
//! - [`token`] - token provider seam and the gateway adapter over it
//! - [`transport`] - transport seam and the Socket.IO adapter (feature `socketio`)
//! - [`endpoint`] - environment and platform dependent endpoint resolution
//! - [`config`] - TOML configuration
//! - [`observability`] - structured logging
//!
//! # Quick Start
//!
//! ```rust
//! use realtime_link::connection::{ConnectionStatus, Room};
//! use serde_json::json;
//!
//! // Chat rooms use their own command and the bare room id
//! let command = Room::new("chat", "42").join_command();
//! assert_eq!(command.event, "chat:join_room");
//! assert_eq!(command.payload, json!({"roomId": "42"}));
//!
//! // Every other room sends the `type:id` key
//! let command = Room::new("order", "7").join_command();
//! assert_eq!(command.event, "join_room");
//! assert_eq!(command.payload, json!({"roomId": "order:7"}));
//!
//! assert_eq!(ConnectionStatus::Authenticated.to_string(), "AUTHENTICATED");
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod observability;
pub mod testing;
pub mod token;
pub mod transport;

pub use config::{ConfigError, RealtimeConfig};
pub use connection::{
    handler, ConnectionInfo, ConnectionManager, ConnectionSettings, ConnectionSnapshot,
    ConnectionStatus, EventHandler, HandlerSubscription,
};
pub use error::{ConnectionError, ConnectionResult};
pub use token::{TokenGateway, TokenProvider, TokenState};
pub use transport::{AuthContext, Transport, TransportEvent, TransportFactory};
