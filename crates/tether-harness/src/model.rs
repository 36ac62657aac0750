//! Operations for model-based testing.
//!
//! Operations represent everything clients and the clock can do to the
//! server. They are generated randomly by proptest or decoded from fuzzer
//! input, then replayed through a [`Workload`].

use std::time::Duration;

use arbitrary::Arbitrary;
use serde_json::json;
use tether_proto::{ClientMessage, JoinResponse, RoomId, SessionId, SignalPayload};
use tether_server::{DriverConfig, DriverError};

use crate::SimServer;

/// Client slot (0-indexed, wrapped onto the workload's slot count).
pub type ClientId = u8;

/// Room identifier (wrapped onto a handful of room names so clients collide).
pub type ModelRoomId = u8;

/// Number of distinct room names operations map onto.
const ROOM_NAMES: u8 = 4;

/// Which handshake message a relay operation sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// ICE candidate
    IceCandidate,
}

/// Operations that can be applied to the system.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Open a connection in an empty slot.
    Connect {
        /// Slot to fill.
        client_id: ClientId,
    },

    /// Close a connection and run cleanup.
    Disconnect {
        /// Slot to empty.
        client_id: ClientId,
    },

    /// Break a connection without cleanup; the session stops being live.
    DropConnection {
        /// Slot whose socket dies.
        client_id: ClientId,
    },

    /// Ask to join (or create) a room.
    RequestJoin {
        /// Requesting client.
        client_id: ClientId,
        /// Target room.
        room_id: ModelRoomId,
    },

    /// Answer a join request, rightly or not.
    Respond {
        /// Client answering.
        responder_id: ClientId,
        /// Client the answer is about.
        requester_id: ClientId,
        /// Room the answer is about.
        room_id: ModelRoomId,
        /// Accept or decline.
        accepted: bool,
    },

    /// Leave a room.
    Leave {
        /// Leaving client.
        client_id: ClientId,
        /// Room to leave.
        room_id: ModelRoomId,
    },

    /// Send a handshake message to a room.
    Relay {
        /// Sending client.
        client_id: ClientId,
        /// Target room.
        room_id: ModelRoomId,
        /// Message kind.
        kind: SignalKind,
    },

    /// Send a frame that does not decode.
    SendGarbage {
        /// Sending client.
        client_id: ClientId,
    },

    /// Advance simulation time.
    AdvanceTime {
        /// Milliseconds to advance.
        millis: u16,
    },

    /// Run a driver tick.
    Tick,
}

/// A [`SimServer`] plus a fixed set of client slots.
#[derive(Debug)]
pub struct Workload {
    server: SimServer,
    clients: Vec<Option<SessionId>>,
}

impl Workload {
    /// Workload with `slots` client slots, all initially connected.
    pub fn new(slots: usize, seed: u64, config: DriverConfig) -> Self {
        let mut server = SimServer::with_seed(seed, config);
        let clients = (0..slots.max(1)).map(|_| Some(server.connect())).collect();
        Self { server, clients }
    }

    /// Room name a model room maps onto.
    #[allow(clippy::expect_used)]
    pub fn room_id(room: ModelRoomId) -> RoomId {
        RoomId::new(format!("room-{}", room % ROOM_NAMES))
            .expect("invariant: short ASCII names are valid room ids")
    }

    /// Session currently occupying a slot.
    pub fn session(&self, client_id: ClientId) -> Option<SessionId> {
        self.clients.get(self.slot(client_id)).copied().flatten()
    }

    /// The server under test.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// Mutable access to the server under test.
    pub fn server_mut(&mut self) -> &mut SimServer {
        &mut self.server
    }

    /// Apply one operation.
    ///
    /// Operations on empty slots are no-ops. Driver errors are returned but
    /// expected: a session whose socket died can no longer send.
    pub fn apply(&mut self, op: &Operation) -> Result<(), DriverError> {
        match *op {
            Operation::Connect { client_id } => {
                let slot = self.slot(client_id);
                if self.clients[slot].is_none() {
                    self.clients[slot] = Some(self.server.connect());
                }
                Ok(())
            },
            Operation::Disconnect { client_id } => {
                let slot = self.slot(client_id);
                if let Some(session_id) = self.clients[slot].take() {
                    self.server.disconnect(session_id);
                }
                Ok(())
            },
            Operation::DropConnection { client_id } => {
                if let Some(session_id) = self.session(client_id) {
                    self.server.drop_silently(session_id);
                }
                Ok(())
            },
            Operation::RequestJoin { client_id, room_id } => {
                self.send(client_id, ClientMessage::RequestJoinRoom(Self::room_id(room_id)))
            },
            Operation::Respond { responder_id, requester_id, room_id, accepted } => {
                let Some(requester_id) = self.session(requester_id) else {
                    return Ok(());
                };
                let response =
                    JoinResponse { room_id: Self::room_id(room_id), requester_id, accepted };
                self.send(responder_id, ClientMessage::JoinRequestResponse(response))
            },
            Operation::Leave { client_id, room_id } => {
                self.send(client_id, ClientMessage::LeaveRoom(Self::room_id(room_id)))
            },
            Operation::Relay { client_id, room_id, kind } => {
                let payload = SignalPayload::new(Self::room_id(room_id));
                let message = match kind {
                    SignalKind::Offer => {
                        ClientMessage::Offer(payload.with_field("sdp", json!("v=0 offer")))
                    },
                    SignalKind::Answer => {
                        ClientMessage::Answer(payload.with_field("sdp", json!("v=0 answer")))
                    },
                    SignalKind::IceCandidate => ClientMessage::IceCandidate(
                        payload.with_field("candidate", json!("candidate:1 1 udp 1 10.0.0.1 9 typ host")),
                    ),
                };
                self.send(client_id, message)
            },
            Operation::SendGarbage { client_id } => match self.session(client_id) {
                Some(session_id) => self.server.send_text(session_id, "{\"type\":"),
                None => Ok(()),
            },
            Operation::AdvanceTime { millis } => {
                self.server.advance(Duration::from_millis(u64::from(millis)));
                Ok(())
            },
            Operation::Tick => {
                self.server.tick();
                Ok(())
            },
        }
    }

    fn send(&mut self, client_id: ClientId, message: ClientMessage) -> Result<(), DriverError> {
        match self.session(client_id) {
            Some(session_id) => self.server.send(session_id, message),
            None => Ok(()),
        }
    }

    fn slot(&self, client_id: ClientId) -> usize {
        usize::from(client_id) % self.clients.len()
    }
}
