//! Tether signaling wire protocol.
//!
//! Messages travel as WebSocket text frames, one JSON document per frame,
//! wrapped in a `{"type": ..., "data": ...}` envelope. Message names are
//! kebab-case and payload fields camelCase.
//!
//! # Message Flow
//!
//! ```text
//! requester                server                 authority
//!     │ request-join-room ───>│                         │
//!     │<── awaiting-creator-  │── join-request-received>│
//!     │    approval           │<── join-request-response│
//!     │<── room-joined ───────│── user-joined ─────────>│
//!     │                       │                         │
//!     │ offer/answer/ice ────>│── (verbatim) ──────────>│
//! ```
//!
//! The server never looks inside offer/answer/candidate payloads. Only the
//! `room` field is read, to route the message.

#![forbid(unsafe_code)]

pub mod errors;
mod ids;
pub mod messages;

pub use errors::{ProtocolError, Result};
pub use ids::{MAX_ROOM_ID_LEN, RoomId, SessionId};
pub use messages::{
    ClientMessage, ErrorPayload, JoinRequest, JoinResponse, MAX_MESSAGE_SIZE, RoomJoined,
    RoomNotice, RoomRef, ServerMessage, SignalPayload,
};
