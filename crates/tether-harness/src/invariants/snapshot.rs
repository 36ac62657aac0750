//! Observable state extracted from a running driver.

use std::collections::{BTreeMap, BTreeSet};

use tether_core::Environment;
use tether_proto::{RoomId, SessionId};
use tether_server::ServerDriver;

/// Observable state of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// Current authority
    pub authority: SessionId,
    /// Current members
    pub members: BTreeSet<SessionId>,
    /// Sessions with a pending join request
    pub pending: BTreeSet<SessionId>,
}

/// Observable state of the whole server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemSnapshot {
    /// Rooms by identifier
    pub rooms: BTreeMap<RoomId, RoomSnapshot>,
    /// Reverse index as the store reports it
    pub memberships: BTreeMap<SessionId, BTreeSet<RoomId>>,
    /// Registered sessions, live or not
    pub registered: BTreeSet<SessionId>,
    /// Registered sessions whose connection is open
    pub live: BTreeSet<SessionId>,
}

impl SystemSnapshot {
    /// Snapshot with no rooms and no sessions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture the state of a driver.
    ///
    /// Rooms are copied shard by shard, so the capture is only consistent
    /// when no other thread is driving the server.
    pub fn capture<E: Environment>(driver: &ServerDriver<E>) -> Self {
        let store = driver.rooms().store();

        let rooms = store
            .snapshot()
            .into_iter()
            .map(|(room_id, room)| {
                let snapshot = RoomSnapshot {
                    authority: room.authority(),
                    members: room.members().clone(),
                    pending: room.pending_requests().map(|(requester, _)| requester).collect(),
                };
                (room_id, snapshot)
            })
            .collect();

        let memberships = store
            .membership_index()
            .into_iter()
            .filter(|(_, rooms)| !rooms.is_empty())
            .collect();

        let registry = driver.registry();
        let live: BTreeSet<_> = registry.live_sessions().into_iter().collect();
        let registered = registry.sessions().into_iter().collect();

        Self { rooms, memberships, registered, live }
    }
}
