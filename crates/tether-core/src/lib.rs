//! Runtime-independent building blocks for the Tether signaling server.
//!
//! Nothing here performs I/O. Time and randomness come in through the
//! [`Environment`] trait so the same code runs under tokio in production and
//! under a virtual clock in the simulation harness.

#![forbid(unsafe_code)]

pub mod connection;
pub mod env;
pub mod error;

pub use connection::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_IDLE_TIMEOUT,
};
pub use env::Environment;
pub use error::ConnectionError;
