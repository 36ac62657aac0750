//! Room store with per-room serialization.
//!
//! Rooms live in a fixed array of mutex-guarded shards selected by hashing
//! the room name. Every read-modify-write on a room runs inside its shard
//! lock via [`RoomStore::update`], so two handlers touching the same room
//! are serialized while handlers for unrelated rooms rarely contend.
//!
//! The store also owns the reverse index `session → rooms`, used to find
//! every room a disconnecting session was in. The index is only written by
//! [`RoomSlot`] while the room's shard lock is held.
//!
//! # Lock order
//!
//! Room shard, then membership index (or session registry). Nothing takes a
//! shard lock while holding the index lock.
//!
//! # Invariants
//!
//! - A room exists if and only if its member set is non-empty
//! - A room's authority is always one of its members
//! - The index lists a room for a session exactly when the session is a member

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    hash::{BuildHasher, RandomState},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tether_proto::{RoomId, SessionId};
use thiserror::Error;

/// Number of lock shards. Rooms hash onto one of these.
const SHARD_COUNT: usize = 32;

/// Errors from room store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Room does not exist
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Room already exists
    #[error("room already exists: {0}")]
    RoomAlreadyExists(RoomId),
}

/// State of one room.
///
/// Members are kept ordered so authority election is deterministic.
#[derive(Debug, Clone)]
pub struct Room<I> {
    authority: SessionId,
    members: BTreeSet<SessionId>,
    pending: BTreeMap<SessionId, I>,
    created_at: I,
}

impl<I: Copy> Room<I> {
    fn new(authority: SessionId, now: I) -> Self {
        Self {
            authority,
            members: BTreeSet::from([authority]),
            pending: BTreeMap::new(),
            created_at: now,
        }
    }

    /// Session that approves or declines join requests.
    pub fn authority(&self) -> SessionId {
        self.authority
    }

    /// Current members, ascending.
    pub fn members(&self) -> &BTreeSet<SessionId> {
        &self.members
    }

    /// Whether `session_id` is a member.
    pub fn is_member(&self, session_id: SessionId) -> bool {
        self.members.contains(&session_id)
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members other than `session_id`, ascending.
    pub fn members_except(&self, session_id: SessionId) -> Vec<SessionId> {
        self.members.iter().copied().filter(|&member| member != session_id).collect()
    }

    /// When the room was created.
    pub fn created_at(&self) -> I {
        self.created_at
    }

    /// Whether `session_id` has a join request waiting on the authority.
    pub fn has_pending(&self, session_id: SessionId) -> bool {
        self.pending.contains_key(&session_id)
    }

    /// Pending join requests with the time each was made, by requester.
    pub fn pending_requests(&self) -> impl Iterator<Item = (SessionId, I)> + '_ {
        self.pending.iter().map(|(&requester, &requested_at)| (requester, requested_at))
    }

    /// Record a join request. Returns `false` if one was already pending.
    pub(crate) fn add_pending(&mut self, requester: SessionId, now: I) -> bool {
        if self.pending.contains_key(&requester) {
            return false;
        }
        self.pending.insert(requester, now);
        true
    }

    /// Drop a join request, returning when it was made.
    pub(crate) fn remove_pending(&mut self, requester: SessionId) -> Option<I> {
        self.pending.remove(&requester)
    }

    /// Remove every pending request for which `expired` returns true.
    ///
    /// Returns the removed requests in requester order.
    pub(crate) fn drain_pending_where(
        &mut self,
        mut expired: impl FnMut(SessionId, I) -> bool,
    ) -> Vec<(SessionId, I)> {
        let dropped: Vec<_> =
            self.pending_requests().filter(|&(requester, at)| expired(requester, at)).collect();
        for (requester, _) in &dropped {
            self.pending.remove(requester);
        }
        dropped
    }
}

/// Result of removing a member.
#[derive(Debug, Clone)]
pub enum Removal<I> {
    /// The session was not a member; nothing changed
    NotMember,

    /// The session was removed and the room survives
    Removed {
        /// Newly elected authority, if the removed session held authority
        new_authority: Option<SessionId>,
    },

    /// The session was the last member; the room is gone
    RoomDeleted(Room<I>),
}

/// Exclusive access to one room slot, held for the duration of an update.
///
/// The slot may be empty (room does not exist). Member mutations go through
/// the slot so the membership index stays in step.
pub struct RoomSlot<'a, I> {
    room_id: &'a RoomId,
    rooms: &'a mut HashMap<RoomId, Room<I>>,
    memberships: &'a Mutex<HashMap<SessionId, BTreeSet<RoomId>>>,
}

impl<I: Copy> RoomSlot<'_, I> {
    /// Room this slot refers to.
    pub fn room_id(&self) -> &RoomId {
        self.room_id
    }

    /// Current room state, if the room exists.
    pub fn room(&self) -> Option<&Room<I>> {
        self.rooms.get(self.room_id)
    }

    /// Mutable room state for pending-request bookkeeping.
    pub fn room_mut(&mut self) -> Option<&mut Room<I>> {
        self.rooms.get_mut(self.room_id)
    }

    /// Create the room with `authority` as its only member.
    ///
    /// # Errors
    ///
    /// `RoomError::RoomAlreadyExists` if the room exists.
    pub fn create(&mut self, authority: SessionId, now: I) -> Result<&Room<I>, RoomError> {
        if self.rooms.contains_key(self.room_id) {
            return Err(RoomError::RoomAlreadyExists(self.room_id.clone()));
        }

        self.index_insert(authority);
        Ok(&*self.rooms.entry(self.room_id.clone()).or_insert_with(|| Room::new(authority, now)))
    }

    /// Add a member. Idempotent: returns `false` if already present.
    ///
    /// Clears any pending request the session had for this room.
    ///
    /// # Errors
    ///
    /// `RoomError::RoomNotFound` if the room does not exist.
    pub fn add_member(&mut self, session_id: SessionId) -> Result<bool, RoomError> {
        let room = self
            .rooms
            .get_mut(self.room_id)
            .ok_or_else(|| RoomError::RoomNotFound(self.room_id.clone()))?;

        room.pending.remove(&session_id);
        if !room.members.insert(session_id) {
            return Ok(false);
        }

        self.index_insert(session_id);
        Ok(true)
    }

    /// Remove a member, repairing the authority invariant in the same step.
    ///
    /// If the removed session held authority and others remain, the lowest
    /// remaining session identifier becomes authority. If nobody remains,
    /// the room is deleted.
    pub fn remove_member(&mut self, session_id: SessionId) -> Removal<I> {
        let Some(room) = self.rooms.get_mut(self.room_id) else {
            return Removal::NotMember;
        };
        if !room.members.remove(&session_id) {
            return Removal::NotMember;
        }

        let outcome = match room.members.first().copied() {
            None => None,
            Some(lowest) if room.authority == session_id => {
                room.authority = lowest;
                Some(Some(lowest))
            },
            Some(_) => Some(None),
        };

        self.index_remove(session_id);

        match outcome {
            Some(new_authority) => Removal::Removed { new_authority },
            None => match self.rooms.remove(self.room_id) {
                Some(room) => Removal::RoomDeleted(room),
                None => Removal::NotMember,
            },
        }
    }

    fn index(&self) -> MutexGuard<'_, HashMap<SessionId, BTreeSet<RoomId>>> {
        self.memberships.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_insert(&self, session_id: SessionId) {
        self.index().entry(session_id).or_default().insert(self.room_id.clone());
    }

    fn index_remove(&self, session_id: SessionId) {
        let mut index = self.index();
        if let Some(rooms) = index.get_mut(&session_id) {
            rooms.remove(self.room_id);
            if rooms.is_empty() {
                index.remove(&session_id);
            }
        }
    }
}

/// Sharded, lock-guarded mapping from room name to room state.
#[derive(Debug)]
pub struct RoomStore<I> {
    shards: Box<[Mutex<HashMap<RoomId, Room<I>>>]>,
    hasher: RandomState,
    memberships: Mutex<HashMap<SessionId, BTreeSet<RoomId>>>,
}

impl<I: Copy> Default for RoomStore<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Copy> RoomStore<I> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            memberships: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, room_id: &RoomId) -> MutexGuard<'_, HashMap<RoomId, Room<I>>> {
        let index = self.hasher.hash_one(room_id) as usize % self.shards.len();
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self) -> MutexGuard<'_, HashMap<SessionId, BTreeSet<RoomId>>> {
        self.memberships.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to one room.
    ///
    /// Other updates to the same room wait; updates to rooms on other
    /// shards proceed. `f` must not call back into the store.
    pub fn update<R>(&self, room_id: &RoomId, f: impl FnOnce(&mut RoomSlot<'_, I>) -> R) -> R {
        let mut rooms = self.shard(room_id);
        let mut slot = RoomSlot { room_id, rooms: &mut *rooms, memberships: &self.memberships };
        f(&mut slot)
    }

    /// Run `f` against the current state of one room.
    pub fn read<R>(&self, room_id: &RoomId, f: impl FnOnce(Option<&Room<I>>) -> R) -> R {
        let rooms = self.shard(room_id);
        f(rooms.get(room_id))
    }

    /// Insert a room with `authority` as its only member.
    ///
    /// # Errors
    ///
    /// `RoomError::RoomAlreadyExists` if the room exists.
    pub fn create_room(&self, room_id: &RoomId, authority: SessionId, now: I) -> Result<(), RoomError> {
        self.update(room_id, |slot| slot.create(authority, now).map(|_| ()))
    }

    /// Copy of a room's state.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room<I>> {
        self.read(room_id, |room| room.cloned())
    }

    /// Add a member. Idempotent.
    ///
    /// # Errors
    ///
    /// `RoomError::RoomNotFound` if the room does not exist.
    pub fn add_member(&self, room_id: &RoomId, session_id: SessionId) -> Result<bool, RoomError> {
        self.update(room_id, |slot| slot.add_member(session_id))
    }

    /// Remove a member, electing a new authority or deleting the room.
    pub fn remove_member(&self, room_id: &RoomId, session_id: SessionId) -> Removal<I> {
        self.update(room_id, |slot| slot.remove_member(session_id))
    }

    /// Rooms a session is currently a member of, ascending.
    pub fn rooms_for_session(&self, session_id: SessionId) -> Vec<RoomId> {
        self.index().get(&session_id).map(|rooms| rooms.iter().cloned().collect()).unwrap_or_default()
    }

    /// Remove pending join requests for which `expired` returns true, across
    /// every room.
    ///
    /// Each shard is locked once and rooms with nothing pending are skipped,
    /// so an idle sweep costs one lock per shard. Results are grouped by
    /// room, ascending.
    pub fn drain_pending_where(
        &self,
        mut expired: impl FnMut(SessionId, I) -> bool,
    ) -> Vec<(RoomId, Vec<(SessionId, I)>)> {
        let mut drained = Vec::new();
        for shard in &*self.shards {
            let mut rooms = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (room_id, room) in rooms.iter_mut().filter(|(_, room)| !room.pending.is_empty()) {
                let dropped = room.drain_pending_where(&mut expired);
                if !dropped.is_empty() {
                    drained.push((room_id.clone(), dropped));
                }
            }
        }
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Number of rooms.
    pub fn room_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Copy of every room, ascending by name.
    ///
    /// Shards are locked one at a time, so under concurrent mutation the
    /// result is not a single consistent cut.
    pub fn snapshot(&self) -> Vec<(RoomId, Room<I>)> {
        let mut rooms: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let rooms = shard.lock().unwrap_or_else(PoisonError::into_inner);
                rooms.iter().map(|(id, room)| (id.clone(), room.clone())).collect::<Vec<_>>()
            })
            .collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms
    }

    /// Copy of the reverse index.
    pub fn membership_index(&self) -> HashMap<SessionId, BTreeSet<RoomId>> {
        self.index().clone()
    }
}
