//! Room Manager
//!
//! Decides who gets into a room, who holds authority over it, and who
//! receives each handshake message. All state lives in the [`RoomStore`];
//! every decision about one room is made inside that room's lock, and the
//! recipients of each notification are resolved there too.
//!
//! The manager never sends anything. Operations return [`RoomAction`]s that
//! the driver turns into transport actions. Liveness of other sessions is
//! asked through an `is_live` callback so the manager does not depend on the
//! session registry directly.
//!
//! The join workflow lives in `join.rs` and the departure handler in
//! `departure.rs`; both extend [`RoomManager`].

use std::{fmt::Debug, ops::Sub, time::Duration};

use tether_proto::{RoomId, ServerMessage, SessionId};

use crate::{driver::LogLevel, room_store::RoomStore};

/// Status line for the creator of a new room.
pub const ROOM_CREATED: &str = "room created";
/// Status line when a repeated join finds the session already inside.
pub const ALREADY_IN_ROOM: &str = "already in room";
/// Status line for a requester admitted by the authority.
pub const JOIN_ACCEPTED: &str = "join request accepted";
/// Status line for a requester admitted because the authority is gone.
pub const JOINED_DIRECTLY: &str = "room creator unavailable, joined directly";
/// Status line while a request waits on the authority.
pub const AWAITING_APPROVAL: &str = "waiting for room creator approval";
/// Status line for a declined request.
pub const JOIN_DECLINED: &str = "join request declined";
/// Status line when the room vanished before the request was settled.
pub const ROOM_GONE: &str = "room no longer exists";
/// Status line when a pending request expires.
pub const JOIN_TIMED_OUT: &str = "join request timed out";

/// Actions returned by `RoomManager` for the driver to execute.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomAction<I> {
    /// Send a message to one session
    Notify {
        /// Recipient
        session_id: SessionId,
        /// Message to send
        message: ServerMessage,
    },

    /// Send one message to several sessions
    Broadcast {
        /// Recipients, resolved under the room lock
        recipients: Vec<SessionId>,
        /// Message to send
        message: ServerMessage,
    },

    /// Record something worth logging
    Log {
        /// Log level
        level: LogLevel,
        /// What happened
        message: String,
        /// When the operation was processed
        processed_at: I,
    },
}

impl<I> RoomAction<I> {
    pub(crate) fn notify(session_id: SessionId, message: ServerMessage) -> Self {
        Self::Notify { session_id, message }
    }

    /// Broadcast, or nothing if there is nobody to tell.
    pub(crate) fn broadcast(recipients: Vec<SessionId>, message: ServerMessage) -> Option<Self> {
        (!recipients.is_empty()).then_some(Self::Broadcast { recipients, message })
    }

    pub(crate) fn log(level: LogLevel, message: String, processed_at: I) -> Self {
        Self::Log { level, message, processed_at }
    }
}

/// Join coordinator, signaling relay and departure handler.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct RoomManager<I> {
    pub(crate) store: RoomStore<I>,
    pub(crate) join_request_timeout: Option<Duration>,
}

impl<I> Default for RoomManager<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new(None)
    }
}

impl<I> RoomManager<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// Create a manager. `join_request_timeout` of `None` keeps requests
    /// pending until the authority answers or leaves.
    pub fn new(join_request_timeout: Option<Duration>) -> Self {
        Self { store: RoomStore::new(), join_request_timeout }
    }

    /// Underlying room store.
    pub fn store(&self) -> &RoomStore<I> {
        &self.store
    }

    /// Forward a handshake message to every other member of its room.
    ///
    /// The sender need not be a member and never receives its own message.
    /// A missing room or an empty recipient list is a silent no-op.
    pub fn relay(
        &self,
        sender: SessionId,
        room_id: &RoomId,
        message: ServerMessage,
        now: I,
    ) -> Vec<RoomAction<I>> {
        let recipients =
            self.store.read(room_id, |room| room.map(|room| room.members_except(sender)));

        match recipients {
            Some(recipients) => {
                let kind = message.kind();
                let count = recipients.len();
                match RoomAction::broadcast(recipients, message) {
                    Some(action) => vec![
                        action,
                        RoomAction::log(
                            LogLevel::Debug,
                            format!("relayed {kind} from {sender} to {count} peers in {room_id}"),
                            now,
                        ),
                    ],
                    None => Vec::new(),
                }
            },
            None => vec![RoomAction::log(
                LogLevel::Debug,
                format!("dropped {} from {sender}: no room {room_id}", message.kind()),
                now,
            )],
        }
    }
}
