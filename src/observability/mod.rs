//! Observability for the realtime connection manager
//!
//! Structured logging with `tracing`; connection state itself is observed
//! through the connection state store.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{connection_span, token_span};
