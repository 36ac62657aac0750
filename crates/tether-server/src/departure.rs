//! Presence and departure handling.
//!
//! Explicit `leave-room` and transport disconnects funnel into one routine,
//! run once per affected room inside that room's lock:
//!
//! 1. compute the other members (before removal) and tell them `user-left`
//! 2. remove the session, which elects a new authority or deletes the room
//! 3. tell a newly elected authority `you-are-creator` and hand it the
//!    requests still waiting on the old authority
//!
//! Because both triggers share the routine, an election produces exactly one
//! authority notification whichever way the old authority went.

use std::{fmt::Debug, ops::Sub, time::Duration};

use tether_proto::{JoinRequest, RoomId, RoomNotice, RoomRef, ServerMessage, SessionId};

use crate::{
    driver::LogLevel,
    room_manager::{ROOM_GONE, RoomAction, RoomManager},
    room_store::Removal,
};

impl<I> RoomManager<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// Handle `leave-room`.
    ///
    /// A session that only has a pending request for the room has that
    /// request cancelled instead.
    pub fn leave_room(
        &self,
        session_id: SessionId,
        room_id: &RoomId,
        now: I,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        self.depart(session_id, room_id, now, &is_live)
    }

    /// Clean up every room a disconnected session was a member of.
    pub fn disconnect(
        &self,
        session_id: SessionId,
        now: I,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        self.store
            .rooms_for_session(session_id)
            .iter()
            .flat_map(|room_id| self.depart(session_id, room_id, now, &is_live))
            .collect()
    }

    fn depart(
        &self,
        session_id: SessionId,
        room_id: &RoomId,
        now: I,
        is_live: &impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        self.store.update(room_id, |slot| {
            let Some(room) = slot.room() else {
                return Vec::new();
            };

            if !room.is_member(session_id) {
                let cancelled = slot.room_mut().and_then(|room| room.remove_pending(session_id));
                return match cancelled {
                    Some(_) => vec![RoomAction::log(
                        LogLevel::Debug,
                        format!("{session_id} cancelled join request for {room_id}"),
                        now,
                    )],
                    None => Vec::new(),
                };
            }

            let others = room.members_except(session_id);
            let mut actions: Vec<_> =
                RoomAction::broadcast(others, ServerMessage::UserLeft(session_id)).into_iter().collect();

            match slot.remove_member(session_id) {
                Removal::NotMember => {},
                Removal::Removed { new_authority: None } => {
                    actions.push(RoomAction::log(
                        LogLevel::Debug,
                        format!("{session_id} left {room_id}"),
                        now,
                    ));
                },
                Removal::Removed { new_authority: Some(authority) } => {
                    actions.push(RoomAction::notify(
                        authority,
                        ServerMessage::YouAreCreator(RoomRef { room_id: room_id.clone() }),
                    ));

                    let waiting: Vec<_> = slot
                        .room()
                        .map(|room| room.pending_requests().map(|(requester, _)| requester).collect())
                        .unwrap_or_default();
                    for requester in waiting.into_iter().filter(|&r| is_live(r)) {
                        actions.push(RoomAction::notify(
                            authority,
                            ServerMessage::JoinRequestReceived(JoinRequest {
                                room_id: room_id.clone(),
                                requester_id: requester,
                            }),
                        ));
                    }

                    actions.push(RoomAction::log(
                        LogLevel::Info,
                        format!("{session_id} left {room_id}, authority passed to {authority}"),
                        now,
                    ));
                },
                Removal::RoomDeleted(room) => {
                    for (requester, _) in room.pending_requests().filter(|&(r, _)| is_live(r)) {
                        actions.push(RoomAction::notify(
                            requester,
                            ServerMessage::JoinDeclined(RoomNotice {
                                room_id: room_id.clone(),
                                message: ROOM_GONE.to_string(),
                            }),
                        ));
                    }
                    actions.push(RoomAction::log(
                        LogLevel::Info,
                        format!(
                            "{session_id} left {room_id}, room deleted after {:?}",
                            now - room.created_at()
                        ),
                        now,
                    ));
                },
            }

            actions
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    fn all_live(_: SessionId) -> bool {
        true
    }

    fn sent(actions: &[RoomAction<Duration>]) -> Vec<(SessionId, ServerMessage)> {
        actions
            .iter()
            .flat_map(|action| match action {
                RoomAction::Notify { session_id, message } => vec![(*session_id, message.clone())],
                RoomAction::Broadcast { recipients, message } => {
                    recipients.iter().map(|r| (*r, message.clone())).collect()
                },
                RoomAction::Log { .. } => Vec::new(),
            })
            .collect()
    }

    fn manager_with(name: &str, members: &[u64]) -> RoomManager<Duration> {
        let manager = RoomManager::new(None);
        manager.store().create_room(&room(name), sid(members[0]), Duration::ZERO).unwrap();
        for &m in &members[1..] {
            manager.store().add_member(&room(name), sid(m)).unwrap();
        }
        manager
    }

    fn you_are_creator(name: &str) -> ServerMessage {
        ServerMessage::YouAreCreator(RoomRef { room_id: room(name) })
    }

    #[test]
    fn authority_leaving_hands_over_once() {
        let manager = manager_with("r1", &[1, 2, 3]);

        let actions = manager.disconnect(sid(1), Duration::ZERO, all_live);

        let messages = sent(&actions);
        assert!(messages.contains(&(sid(2), ServerMessage::UserLeft(sid(1)))));
        assert!(messages.contains(&(sid(3), ServerMessage::UserLeft(sid(1)))));
        let elections: Vec<_> =
            messages.iter().filter(|(_, m)| matches!(m, ServerMessage::YouAreCreator(_))).collect();
        assert_eq!(elections, vec![&(sid(2), you_are_creator("r1"))]);

        let r = manager.store().get_room(&room("r1")).unwrap();
        assert_eq!(r.authority(), sid(2));
        assert_eq!(r.member_count(), 2);
    }

    #[test]
    fn member_leaving_keeps_authority() {
        let manager = manager_with("r1", &[1, 2]);

        let actions = manager.leave_room(sid(2), &room("r1"), Duration::ZERO, all_live);

        assert_eq!(sent(&actions), vec![(sid(1), ServerMessage::UserLeft(sid(2)))]);
        assert_eq!(manager.store().get_room(&room("r1")).unwrap().authority(), sid(1));
    }

    #[test]
    fn last_member_leaving_deletes_room() {
        let manager = manager_with("r1", &[1]);

        let actions = manager.leave_room(sid(1), &room("r1"), Duration::ZERO, all_live);

        assert!(sent(&actions).is_empty());
        assert!(manager.store().get_room(&room("r1")).is_none());
    }

    #[test]
    fn room_deletion_logs_lifetime() {
        let manager = RoomManager::new(None);
        manager.store().create_room(&room("r1"), sid(1), Duration::from_secs(5)).unwrap();

        let actions = manager.leave_room(sid(1), &room("r1"), Duration::from_secs(65), all_live);

        assert_eq!(
            actions,
            vec![RoomAction::Log {
                level: LogLevel::Info,
                message: format!("{} left r1, room deleted after 60s", sid(1)),
                processed_at: Duration::from_secs(65),
            }]
        );
    }

    #[test]
    fn disconnect_covers_every_room() {
        let manager = manager_with("a", &[1, 2]);
        manager.store().create_room(&room("b"), sid(3), Duration::ZERO).unwrap();
        manager.store().add_member(&room("b"), sid(1)).unwrap();
        manager.store().create_room(&room("c"), sid(1), Duration::ZERO).unwrap();

        let actions = manager.disconnect(sid(1), Duration::ZERO, all_live);

        let messages = sent(&actions);
        assert!(messages.contains(&(sid(2), ServerMessage::UserLeft(sid(1)))));
        assert!(messages.contains(&(sid(2), you_are_creator("a"))));
        assert!(messages.contains(&(sid(3), ServerMessage::UserLeft(sid(1)))));
        assert!(manager.store().get_room(&room("c")).is_none());
        assert!(manager.store().rooms_for_session(sid(1)).is_empty());
    }

    #[test]
    fn leaving_room_not_joined_is_noop() {
        let manager = manager_with("r1", &[1]);

        assert!(manager.leave_room(sid(5), &room("r1"), Duration::ZERO, all_live).is_empty());
        assert!(manager.leave_room(sid(1), &room("other"), Duration::ZERO, all_live).is_empty());
    }

    #[test]
    fn leaving_while_pending_cancels_request() {
        let manager = manager_with("r1", &[1]);
        manager.request_join(sid(2), &room("r1"), Duration::ZERO, all_live);

        let actions = manager.leave_room(sid(2), &room("r1"), Duration::ZERO, all_live);

        assert!(sent(&actions).is_empty());
        assert!(!manager.store().get_room(&room("r1")).unwrap().has_pending(sid(2)));
    }

    #[test]
    fn pending_requests_move_to_new_authority() {
        let manager = manager_with("r1", &[1, 2]);
        manager.request_join(sid(5), &room("r1"), Duration::ZERO, all_live);

        let actions = manager.leave_room(sid(1), &room("r1"), Duration::ZERO, all_live);

        assert!(sent(&actions).contains(&(
            sid(2),
            ServerMessage::JoinRequestReceived(JoinRequest { room_id: room("r1"), requester_id: sid(5) })
        )));
        assert!(manager.store().get_room(&room("r1")).unwrap().has_pending(sid(5)));
    }

    #[test]
    fn pending_requesters_declined_when_room_deleted() {
        let manager = manager_with("r1", &[1]);
        manager.request_join(sid(5), &room("r1"), Duration::ZERO, all_live);

        let actions = manager.disconnect(sid(1), Duration::ZERO, all_live);

        assert_eq!(
            sent(&actions),
            vec![(
                sid(5),
                ServerMessage::JoinDeclined(RoomNotice {
                    room_id: room("r1"),
                    message: ROOM_GONE.to_string()
                })
            )]
        );
    }
}
