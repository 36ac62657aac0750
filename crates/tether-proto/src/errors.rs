//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or validating wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match any known message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Room identifiers must be non-empty and bounded in length.
    #[error("invalid room id: {reason}")]
    InvalidRoomId {
        /// Why the identifier was rejected
        reason: String,
    },

    /// Session identifiers are 16 lowercase hex digits.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Inbound frame exceeds [`crate::MAX_MESSAGE_SIZE`].
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Received size in bytes
        size: usize,
        /// Maximum accepted size in bytes
        max: usize,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
