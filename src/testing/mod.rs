//! Testing utilities and mock implementations
//!
//! Mocks for the transport and token provider seams, so the connection manager
//! can be exercised without a realtime server or an authentication backend.

pub mod mocks;

pub use mocks::*;
