//! Error types for connection bookkeeping.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors from the per-connection liveness state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Activity was reported on a connection that is already closed
    #[error("connection closed")]
    Closed,

    /// No inbound traffic within the idle timeout
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long the connection was silent
        elapsed: Duration,
    },
}

impl ConnectionError {
    /// Returns true if this error came from the peer going quiet rather
    /// than from misuse of a closed connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::IdleTimeout { .. })
    }
}

/// Boundary conversion for async I/O APIs.
impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::IdleTimeout { .. } => io::ErrorKind::TimedOut,
            ConnectionError::Closed => io::ErrorKind::NotConnected,
        };
        Self::new(kind, err.to_string())
    }
}
