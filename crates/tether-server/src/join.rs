//! Join workflow.
//!
//! ```text
//!                 request-join-room
//!                        │
//!        ┌───────────────┼──────────────────────┐
//!   no room         authority live        authority dead
//!        │               │                      │
//!   JOINED_AS_      AWAITING_APPROVAL      JOINED_DIRECT
//!   AUTHORITY            │
//!              join-request-response
//!             ┌──────────┼───────────┐
//!        accepted     declined   room gone
//!             │          │           │
//!      JOINED_ACCEPTED  DECLINED   DECLINED
//! ```
//!
//! A response is only honoured when it comes from the room's current
//! authority for a request that is actually pending, so a member cannot
//! admit anyone by forging a response.

use std::{fmt::Debug, ops::Sub, time::Duration};

use tether_proto::{
    JoinRequest, JoinResponse, RoomId, RoomJoined, RoomNotice, ServerMessage, SessionId,
};

use crate::{
    driver::LogLevel,
    room_manager::{
        ALREADY_IN_ROOM, AWAITING_APPROVAL, JOIN_ACCEPTED, JOIN_DECLINED, JOIN_TIMED_OUT,
        JOINED_DIRECTLY, ROOM_CREATED, ROOM_GONE, RoomAction, RoomManager,
    },
};

fn room_joined(room_id: &RoomId, is_creator: bool, message: &str) -> ServerMessage {
    ServerMessage::RoomJoined(RoomJoined {
        room_id: room_id.clone(),
        is_creator,
        message: message.to_string(),
    })
}

fn notice(room_id: &RoomId, message: &str) -> RoomNotice {
    RoomNotice { room_id: room_id.clone(), message: message.to_string() }
}

impl<I> RoomManager<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// Handle `request-join-room`.
    pub fn request_join(
        &self,
        requester: SessionId,
        room_id: &RoomId,
        now: I,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        self.store.update(room_id, |slot| {
            let Some(room) = slot.room() else {
                return match slot.create(requester, now) {
                    Ok(_) => vec![
                        RoomAction::notify(requester, room_joined(room_id, true, ROOM_CREATED)),
                        RoomAction::log(
                            LogLevel::Info,
                            format!("room {room_id} created by {requester}"),
                            now,
                        ),
                    ],
                    Err(err) => vec![RoomAction::log(LogLevel::Error, err.to_string(), now)],
                };
            };

            if room.is_member(requester) {
                let is_creator = room.authority() == requester;
                return vec![RoomAction::notify(
                    requester,
                    room_joined(room_id, is_creator, ALREADY_IN_ROOM),
                )];
            }

            let awaiting = RoomAction::notify(
                requester,
                ServerMessage::AwaitingCreatorApproval(notice(room_id, AWAITING_APPROVAL)),
            );

            let authority = room.authority();
            if is_live(authority) {
                if room.has_pending(requester) {
                    return vec![awaiting];
                }
                if let Some(room) = slot.room_mut() {
                    room.add_pending(requester, now);
                }
                let request = ServerMessage::JoinRequestReceived(JoinRequest {
                    room_id: room_id.clone(),
                    requester_id: requester,
                });
                return vec![
                    RoomAction::notify(authority, request),
                    awaiting,
                    RoomAction::log(
                        LogLevel::Debug,
                        format!("{requester} asked {authority} to join {room_id}"),
                        now,
                    ),
                ];
            }

            // Authority unreachable: admit directly so the room is not orphaned.
            // This also settles a request left pending by the dead authority.
            let others: Vec<_> =
                room.members().iter().copied().filter(|&member| is_live(member)).collect();
            let mut actions = Vec::new();
            if let Err(err) = slot.add_member(requester) {
                return vec![RoomAction::log(LogLevel::Error, err.to_string(), now)];
            }
            actions.extend(RoomAction::broadcast(others, ServerMessage::UserJoined(requester)));
            actions.push(RoomAction::notify(requester, room_joined(room_id, false, JOINED_DIRECTLY)));
            actions.push(RoomAction::log(
                LogLevel::Info,
                format!("{requester} joined {room_id} directly, authority {authority} not live"),
                now,
            ));
            actions
        })
    }

    /// Handle `join-request-response` from `responder`.
    pub fn respond_to_join(
        &self,
        responder: SessionId,
        response: &JoinResponse,
        now: I,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        let JoinResponse { room_id, requester_id: requester, accepted } = response;
        let requester = *requester;

        self.store.update(room_id, |slot| {
            if !is_live(requester) {
                if let Some(room) = slot.room_mut() {
                    if room.authority() == responder {
                        room.remove_pending(requester);
                    }
                }
                return vec![RoomAction::log(
                    LogLevel::Debug,
                    format!("dropped response for {requester} in {room_id}: requester gone"),
                    now,
                )];
            }

            let Some(room) = slot.room() else {
                let reason = if *accepted { ROOM_GONE } else { JOIN_DECLINED };
                return vec![RoomAction::notify(
                    requester,
                    ServerMessage::JoinDeclined(notice(room_id, reason)),
                )];
            };

            if room.authority() != responder {
                return vec![RoomAction::log(
                    LogLevel::Warn,
                    format!("ignored response from {responder} in {room_id}: not the authority"),
                    now,
                )];
            }

            if !room.has_pending(requester) {
                return vec![RoomAction::log(
                    LogLevel::Warn,
                    format!("ignored response for {requester} in {room_id}: nothing pending"),
                    now,
                )];
            }

            if !*accepted {
                if let Some(room) = slot.room_mut() {
                    room.remove_pending(requester);
                }
                return vec![
                    RoomAction::notify(
                        requester,
                        ServerMessage::JoinDeclined(notice(room_id, JOIN_DECLINED)),
                    ),
                    RoomAction::log(
                        LogLevel::Debug,
                        format!("{responder} declined {requester} in {room_id}"),
                        now,
                    ),
                ];
            }

            if let Err(err) = slot.add_member(requester) {
                return vec![RoomAction::log(LogLevel::Error, err.to_string(), now)];
            }

            let others = slot.room().map(|room| room.members_except(requester)).unwrap_or_default();
            let mut actions =
                vec![RoomAction::notify(requester, room_joined(room_id, false, JOIN_ACCEPTED))];
            actions.extend(RoomAction::broadcast(others, ServerMessage::UserJoined(requester)));
            actions.push(RoomAction::log(
                LogLevel::Info,
                format!("{responder} admitted {requester} to {room_id}"),
                now,
            ));
            actions
        })
    }

    /// Expire old join requests and purge requests from dead sessions.
    ///
    /// Requests older than the configured timeout get `join-declined`.
    /// Requests whose requester is no longer live are dropped silently.
    pub fn expire_join_requests(
        &self,
        now: I,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<RoomAction<I>> {
        let timeout = self.join_request_timeout;
        let mut actions = Vec::new();

        let expired = self.store.drain_pending_where(|requester, requested_at| {
            !is_live(requester) || timeout.is_some_and(|t| now - requested_at >= t)
        });

        for (room_id, requests) in expired {
            for (requester, _) in requests {
                if !is_live(requester) {
                    continue;
                }
                actions.push(RoomAction::notify(
                    requester,
                    ServerMessage::JoinDeclined(notice(&room_id, JOIN_TIMED_OUT)),
                ));
                actions.push(RoomAction::log(
                    LogLevel::Debug,
                    format!("join request from {requester} for {room_id} timed out"),
                    now,
                ));
            }
        }

        actions
    }
}
