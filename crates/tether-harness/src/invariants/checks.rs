//! Standard invariant checks.
//!
//! These hold after every operation, whatever sequence led there.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// A room's authority is one of its members.
pub struct AuthorityIsMember;

impl Invariant for AuthorityIsMember {
    fn name(&self) -> &'static str {
        "authority_is_member"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (room_id, room) in &state.rooms {
            if !room.members.contains(&room.authority) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "room {room_id}: authority {} not in members {:?}",
                        room.authority, room.members
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A room exists only while it has members.
pub struct NoEmptyRooms;

impl Invariant for NoEmptyRooms {
    fn name(&self) -> &'static str {
        "no_empty_rooms"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        match state.rooms.iter().find(|(_, room)| room.members.is_empty()) {
            Some((room_id, _)) => Err(Violation {
                invariant: self.name(),
                message: format!("room {room_id} has no members"),
            }),
            None => Ok(()),
        }
    }
}

/// The session-to-rooms index agrees with room member sets in both
/// directions.
pub struct MembershipIndexConsistent;

impl Invariant for MembershipIndexConsistent {
    fn name(&self) -> &'static str {
        "membership_index_consistent"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (room_id, room) in &state.rooms {
            for member in &room.members {
                let indexed = state.memberships.get(member).is_some_and(|rooms| rooms.contains(room_id));
                if !indexed {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("{member} is in {room_id} but the index omits it"),
                    });
                }
            }
        }

        for (session_id, rooms) in &state.memberships {
            for room_id in rooms {
                let member =
                    state.rooms.get(room_id).is_some_and(|room| room.members.contains(session_id));
                if !member {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("index lists {session_id} in {room_id} but it is not a member"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Nobody waits for approval into a room they are already in.
pub struct PendingNotMember;

impl Invariant for PendingNotMember {
    fn name(&self) -> &'static str {
        "pending_not_member"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (room_id, room) in &state.rooms {
            if let Some(both) = room.pending.intersection(&room.members).next() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{both} is both a member of and pending for {room_id}"),
                });
            }
        }
        Ok(())
    }
}

/// Every room member is a registered session.
///
/// Cleanup after a disconnect removes the session from all of its rooms, so
/// an unregistered member means cleanup missed a room.
pub struct MembersAreConnected;

impl Invariant for MembersAreConnected {
    fn name(&self) -> &'static str {
        "members_are_connected"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (room_id, room) in &state.rooms {
            if let Some(stale) = room.members.difference(&state.registered).next() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{stale} is in {room_id} after disconnecting"),
                });
            }
        }
        Ok(())
    }
}
