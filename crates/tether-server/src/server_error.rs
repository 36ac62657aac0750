//! Driver error types.
//!
//! Errors returned by [`crate::ServerDriver::process_event`]. None of them is
//! fatal to the process: the runtime logs them and carries on with the next
//! event.

use std::fmt;

use tether_proto::{ProtocolError, SessionId};

use crate::room_store::RoomError;

/// Errors that can occur while processing a driver event.
#[derive(Debug)]
pub enum ServerError {
    /// Session not found in registry.
    ///
    /// An event arrived for a session that was never accepted or has
    /// already been closed. Usually a benign race with disconnect.
    SessionNotFound(SessionId),

    /// Session already registered.
    ///
    /// The runtime picked an identifier that is in use. The runtime retries
    /// with a fresh identifier.
    SessionAlreadyExists(SessionId),

    /// Room operation failed.
    Room(RoomError),

    /// The session's connection is closed (for example by idle timeout) but
    /// the transport has not reported the close yet.
    ConnectionFailed {
        /// Session that failed
        session_id: SessionId,
        /// Error message
        reason: String,
    },

    /// Message encoding/decoding error.
    Protocol(ProtocolError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::SessionAlreadyExists(id) => write!(f, "session already exists: {id}"),
            Self::Room(err) => write!(f, "room error: {err}"),
            Self::ConnectionFailed { session_id, reason } => {
                write!(f, "connection failed for session {session_id}: {reason}")
            },
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Room(err) => Some(err),
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RoomError> for ServerError {
    fn from(err: RoomError) -> Self {
        Self::Room(err)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

#[cfg(test)]
mod tests {
    use tether_proto::RoomId;

    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError::SessionNotFound(SessionId::new(42));
        assert_eq!(err.to_string(), "session not found: 000000000000002a");

        let err = ServerError::ConnectionFailed {
            session_id: SessionId::new(1),
            reason: "connection closed".to_string(),
        };
        assert_eq!(err.to_string(), "connection failed for session 0000000000000001: connection closed");
    }

    #[test]
    fn room_error_is_source() {
        let room = RoomId::new("r1").unwrap();
        let err = ServerError::from(RoomError::RoomNotFound(room));

        assert_eq!(err.to_string(), "room error: room not found: r1");
        assert!(std::error::Error::source(&err).is_some());
    }
}
