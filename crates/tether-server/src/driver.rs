//! Server driver.
//!
//! Ties together the session registry (liveness), the room manager (join
//! workflow, relay, departure) and the environment (time). Events go in,
//! actions come out; the driver performs no I/O.
//!
//! Every method takes `&self`. State is guarded internally by the registry
//! mutex and the room store's shard locks, so many connection tasks can feed
//! events concurrently while operations on one room stay serialized.

use std::time::Duration;

use tether_core::{ConnectionAction, ConnectionConfig, Environment};
use tether_proto::{ClientMessage, ErrorPayload, ProtocolError, ServerMessage, SessionId};

use crate::{
    registry::{Admission, SessionRegistry},
    room_manager::{RoomAction, RoomManager},
    server_error::ServerError,
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (idle timeout, heartbeat interval)
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// How long a join request may wait on the authority. `None` waits
    /// until the authority answers or leaves.
    pub join_request_timeout: Option<Duration>,
    /// Tell every live session when any session disconnects
    pub announce_disconnects: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 10_000,
            join_request_timeout: None,
            announce_disconnects: false,
        }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Identifier assigned by the runtime
        session_id: SessionId,
    },

    /// A message was decoded from a connection
    MessageReceived {
        /// Connection that sent the message
        session_id: SessionId,
        /// The decoded message
        message: ClientMessage,
    },

    /// A frame arrived but could not be decoded
    InvalidMessage {
        /// Connection that sent the frame
        session_id: SessionId,
        /// Why decoding failed
        error: ProtocolError,
    },

    /// The peer answered a ping
    HeartbeatReceived {
        /// Connection that answered
        session_id: SessionId,
    },

    /// A connection was closed (by peer, error or timeout)
    ConnectionClosed {
        /// Connection that was closed
        session_id: SessionId,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for heartbeats and timeouts
    Tick,
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerAction<I> {
    /// Send a message to a specific session
    SendToSession {
        /// Target session
        session_id: SessionId,
        /// Message to send
        message: ServerMessage,
    },

    /// Send one message to several sessions
    Broadcast {
        /// Target sessions
        recipients: Vec<SessionId>,
        /// Message to send
        message: ServerMessage,
    },

    /// Send a transport-level ping
    SendPing {
        /// Target session
        session_id: SessionId,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: SessionId,
        /// Reason for closure
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
        /// When the event occurred
        timestamp: I,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

impl<I> From<RoomAction<I>> for ServerAction<I> {
    fn from(action: RoomAction<I>) -> Self {
        match action {
            RoomAction::Notify { session_id, message } => Self::SendToSession { session_id, message },
            RoomAction::Broadcast { recipients, message } => Self::Broadcast { recipients, message },
            RoomAction::Log { level, message, processed_at } => {
                Self::Log { level, message, timestamp: processed_at }
            },
        }
    }
}

/// Action-based server driver.
pub struct ServerDriver<E: Environment> {
    registry: SessionRegistry<E::Instant>,
    rooms: RoomManager<E::Instant>,
    env: E,
    config: ServerConfig,
}

impl<E: Environment> ServerDriver<E> {
    /// Create a new server driver.
    pub fn new(env: E, config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            rooms: RoomManager::new(config.join_request_timeout),
            env,
            config,
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(
        &self,
        event: ServerEvent,
    ) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                self.handle_connection_accepted(session_id)
            },
            ServerEvent::MessageReceived { session_id, message } => {
                self.handle_message(session_id, message)
            },
            ServerEvent::InvalidMessage { session_id, error } => {
                self.handle_invalid_message(session_id, &error)
            },
            ServerEvent::HeartbeatReceived { session_id } => {
                self.touch(session_id)?;
                Ok(Vec::new())
            },
            ServerEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.handle_connection_closed(session_id, &reason))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    fn handle_connection_accepted(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        let now = self.env.now();

        match self.registry.register_session(
            session_id,
            now,
            self.config.connection.clone(),
            self.config.max_connections,
        ) {
            Admission::Admitted => Ok(vec![
                ServerAction::SendToSession {
                    session_id,
                    message: ServerMessage::SessionAssigned(session_id),
                },
                ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!("session {session_id} connected"),
                    timestamp: now,
                },
            ]),
            Admission::AtCapacity => Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }]),
            Admission::AlreadyRegistered => Err(ServerError::SessionAlreadyExists(session_id)),
        }
    }

    /// Record inbound traffic, rejecting unknown or closed sessions.
    fn touch(&self, session_id: SessionId) -> Result<E::Instant, ServerError> {
        let now = self.env.now();
        match self.registry.record_activity(session_id, now) {
            Some(Ok(())) => Ok(now),
            Some(Err(err)) => {
                Err(ServerError::ConnectionFailed { session_id, reason: err.to_string() })
            },
            None => Err(ServerError::SessionNotFound(session_id)),
        }
    }

    fn handle_message(
        &self,
        session_id: SessionId,
        message: ClientMessage,
    ) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        let now = self.touch(session_id)?;
        let is_live = |id: SessionId| self.registry.is_live(id);

        let actions = match message {
            ClientMessage::RequestJoinRoom(room_id) => {
                self.rooms.request_join(session_id, &room_id, now, is_live)
            },
            ClientMessage::JoinRequestResponse(response) => {
                self.rooms.respond_to_join(session_id, &response, now, is_live)
            },
            ClientMessage::Offer(payload) => {
                let room_id = payload.room.clone();
                self.rooms.relay(session_id, &room_id, ServerMessage::Offer(payload), now)
            },
            ClientMessage::Answer(payload) => {
                let room_id = payload.room.clone();
                self.rooms.relay(session_id, &room_id, ServerMessage::Answer(payload), now)
            },
            ClientMessage::IceCandidate(payload) => {
                let room_id = payload.room.clone();
                self.rooms.relay(session_id, &room_id, ServerMessage::IceCandidate(payload), now)
            },
            ClientMessage::LeaveRoom(room_id) => {
                self.rooms.leave_room(session_id, &room_id, now, is_live)
            },
        };

        Ok(actions.into_iter().map(ServerAction::from).collect())
    }

    fn handle_invalid_message(
        &self,
        session_id: SessionId,
        error: &ProtocolError,
    ) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        let now = self.touch(session_id)?;

        Ok(vec![
            ServerAction::SendToSession {
                session_id,
                message: ServerMessage::Error(ErrorPayload::from(error)),
            },
            ServerAction::Log {
                level: LogLevel::Debug,
                message: format!("invalid message from {session_id}: {error}"),
                timestamp: now,
            },
        ])
    }

    fn handle_connection_closed(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Vec<ServerAction<E::Instant>> {
        let now = self.env.now();

        // Unregister first so the session is not live while its rooms are
        // cleaned up.
        if self.registry.unregister_session(session_id).is_none() {
            return Vec::new();
        }

        let rooms = self.rooms.store().rooms_for_session(session_id).len();
        let mut actions: Vec<_> = self
            .rooms
            .disconnect(session_id, now, |id| self.registry.is_live(id))
            .into_iter()
            .map(ServerAction::from)
            .collect();

        if self.config.announce_disconnects {
            let recipients = self.registry.live_sessions();
            if !recipients.is_empty() {
                actions.push(ServerAction::Broadcast {
                    recipients,
                    message: ServerMessage::UserDisconnected(session_id),
                });
            }
        }

        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!("session {session_id} closed: {reason}, was in {rooms} rooms"),
            timestamp: now,
        });

        actions
    }

    fn handle_tick(&self) -> Vec<ServerAction<E::Instant>> {
        let now = self.env.now();

        let mut actions: Vec<_> = self
            .registry
            .tick(now)
            .into_iter()
            .map(|(session_id, action)| match action {
                ConnectionAction::SendPing => ServerAction::SendPing { session_id },
                ConnectionAction::Close { reason } => {
                    ServerAction::CloseConnection { session_id, reason }
                },
            })
            .collect();

        actions.extend(
            self.rooms
                .expire_join_requests(now, |id| self.registry.is_live(id))
                .into_iter()
                .map(ServerAction::from),
        );

        actions
    }

    /// Session registry.
    pub fn registry(&self) -> &SessionRegistry<E::Instant> {
        &self.registry
    }

    /// Room manager.
    pub fn rooms(&self) -> &RoomManager<E::Instant> {
        &self.rooms
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Driver configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of registered sessions.
    pub fn connection_count(&self) -> usize {
        self.registry.session_count()
    }

    /// Number of rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.store().room_count()
    }
}

impl<E: Environment> std::fmt::Debug for ServerDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("session_count", &self.registry.session_count())
            .field("room_count", &self.room_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use tether_proto::{JoinResponse, RoomId, RoomJoined, SignalPayload};

    use super::*;

    /// Clock that only moves when told to.
    #[derive(Clone, Default)]
    struct TestEnv {
        millis: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn advance(&self, by: Duration) {
            let by = u64::try_from(by.as_millis()).unwrap();
            self.millis.fetch_add(by, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.millis.load(Ordering::SeqCst))
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = u8::try_from(i % 256).unwrap();
            }
        }
    }

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    fn driver(config: ServerConfig) -> (TestEnv, ServerDriver<TestEnv>) {
        let env = TestEnv::default();
        (env.clone(), ServerDriver::new(env, config))
    }

    fn connect(server: &ServerDriver<TestEnv>, n: u64) {
        server.process_event(ServerEvent::ConnectionAccepted { session_id: sid(n) }).unwrap();
    }

    fn send(
        server: &ServerDriver<TestEnv>,
        n: u64,
        message: ClientMessage,
    ) -> Vec<ServerAction<Duration>> {
        server.process_event(ServerEvent::MessageReceived { session_id: sid(n), message }).unwrap()
    }

    fn without_logs(actions: Vec<ServerAction<Duration>>) -> Vec<ServerAction<Duration>> {
        actions.into_iter().filter(|a| !matches!(a, ServerAction::Log { .. })).collect()
    }

    #[test]
    fn server_accepts_connection() {
        let (_, server) = driver(ServerConfig::default());

        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: sid(1) }).unwrap();

        assert_eq!(server.connection_count(), 1);
        assert_eq!(
            actions[0],
            ServerAction::SendToSession {
                session_id: sid(1),
                message: ServerMessage::SessionAssigned(sid(1))
            }
        );
    }

    #[test]
    fn server_rejects_when_max_connections_exceeded() {
        let (_, server) = driver(ServerConfig { max_connections: 2, ..Default::default() });

        connect(&server, 1);
        connect(&server, 2);
        let actions =
            server.process_event(ServerEvent::ConnectionAccepted { session_id: sid(3) }).unwrap();

        assert_eq!(server.connection_count(), 2);
        assert_eq!(
            actions,
            vec![ServerAction::CloseConnection {
                session_id: sid(3),
                reason: "max connections exceeded".to_string()
            }]
        );
    }

    #[test]
    fn duplicate_session_id_is_an_error() {
        let (_, server) = driver(ServerConfig::default());
        connect(&server, 1);

        let result = server.process_event(ServerEvent::ConnectionAccepted { session_id: sid(1) });

        assert!(matches!(result, Err(ServerError::SessionAlreadyExists(id)) if id == sid(1)));
    }

    #[test]
    fn message_from_unknown_session_is_an_error() {
        let (_, server) = driver(ServerConfig::default());

        let result = server.process_event(ServerEvent::MessageReceived {
            session_id: sid(9),
            message: ClientMessage::RequestJoinRoom(room("r1")),
        });

        assert!(matches!(result, Err(ServerError::SessionNotFound(_))));
    }

    #[test]
    fn join_creates_room_and_notifies_creator() {
        let (_, server) = driver(ServerConfig::default());
        connect(&server, 1);

        let actions = without_logs(send(&server, 1, ClientMessage::RequestJoinRoom(room("r1"))));

        assert_eq!(
            actions,
            vec![ServerAction::SendToSession {
                session_id: sid(1),
                message: ServerMessage::RoomJoined(RoomJoined {
                    room_id: room("r1"),
                    is_creator: true,
                    message: "room created".to_string(),
                }),
            }]
        );
        assert_eq!(server.room_count(), 1);
    }

    #[test]
    fn gated_join_round_trip() {
        let (_, server) = driver(ServerConfig::default());
        connect(&server, 1);
        connect(&server, 2);
        send(&server, 1, ClientMessage::RequestJoinRoom(room("r1")));
        send(&server, 2, ClientMessage::RequestJoinRoom(room("r1")));

        let actions = without_logs(send(
            &server,
            1,
            ClientMessage::JoinRequestResponse(JoinResponse {
                room_id: room("r1"),
                requester_id: sid(2),
                accepted: true,
            }),
        ));

        assert!(actions.contains(&ServerAction::Broadcast {
            recipients: vec![sid(1)],
            message: ServerMessage::UserJoined(sid(2)),
        }));
        let members = server.rooms().store().get_room(&room("r1")).unwrap().members().clone();
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![sid(1), sid(2)]);
    }

    #[test]
    fn relay_excludes_sender() {
        let (_, server) = driver(ServerConfig::default());
        for n in 1..=3 {
            connect(&server, n);
        }
        send(&server, 1, ClientMessage::RequestJoinRoom(room("r1")));
        server.rooms().store().add_member(&room("r1"), sid(2)).unwrap();
        server.rooms().store().add_member(&room("r1"), sid(3)).unwrap();

        let payload = SignalPayload::new(room("r1")).with_field("sdp", serde_json::json!("v=0"));
        let actions = without_logs(send(&server, 1, ClientMessage::Offer(payload.clone())));

        assert_eq!(
            actions,
            vec![ServerAction::Broadcast {
                recipients: vec![sid(2), sid(3)],
                message: ServerMessage::Offer(payload),
            }]
        );
    }

    #[test]
    fn invalid_message_gets_error_reply() {
        let (_, server) = driver(ServerConfig::default());
        connect(&server, 1);

        let actions = server
            .process_event(ServerEvent::InvalidMessage {
                session_id: sid(1),
                error: ProtocolError::Malformed("expected value".to_string()),
            })
            .unwrap();

        assert!(matches!(
            &actions[0],
            ServerAction::SendToSession { message: ServerMessage::Error(ErrorPayload { code: 1, .. }), .. }
        ));
    }

    #[test]
    fn connection_closed_cleans_up_rooms() {
        let (_, server) = driver(ServerConfig::default());
        connect(&server, 1);
        connect(&server, 2);
        send(&server, 1, ClientMessage::RequestJoinRoom(room("r1")));
        server.rooms().store().add_member(&room("r1"), sid(2)).unwrap();

        let actions = without_logs(
            server
                .process_event(ServerEvent::ConnectionClosed {
                    session_id: sid(1),
                    reason: "client disconnect".to_string(),
                })
                .unwrap(),
        );

        assert_eq!(server.connection_count(), 1);
        assert!(actions.contains(&ServerAction::SendToSession {
            session_id: sid(2),
            message: ServerMessage::YouAreCreator(tether_proto::RoomRef { room_id: room("r1") }),
        }));
        assert!(!actions.iter().any(|a| matches!(a, ServerAction::Broadcast { message: ServerMessage::UserDisconnected(_), .. })));
    }

    #[test]
    fn disconnects_announced_when_enabled() {
        let (_, server) = driver(ServerConfig { announce_disconnects: true, ..Default::default() });
        connect(&server, 1);
        connect(&server, 2);
        connect(&server, 3);

        let actions = server
            .process_event(ServerEvent::ConnectionClosed {
                session_id: sid(2),
                reason: "gone".to_string(),
            })
            .unwrap();

        assert!(actions.contains(&ServerAction::Broadcast {
            recipients: vec![sid(1), sid(3)],
            message: ServerMessage::UserDisconnected(sid(2)),
        }));
    }

    #[test]
    fn closing_unknown_session_is_quiet() {
        let (_, server) = driver(ServerConfig::default());

        let actions = server
            .process_event(ServerEvent::ConnectionClosed { session_id: sid(4), reason: "x".to_string() })
            .unwrap();

        assert!(actions.is_empty());
    }

    #[test]
    fn tick_sends_heartbeats_then_closes_idle() {
        let (env, server) = driver(ServerConfig::default());
        connect(&server, 1);

        env.advance(Duration::from_secs(20));
        let actions = server.process_event(ServerEvent::Tick).unwrap();
        assert_eq!(actions, vec![ServerAction::SendPing { session_id: sid(1) }]);

        env.advance(Duration::from_secs(41));
        let actions = server.process_event(ServerEvent::Tick).unwrap();
        assert!(matches!(&actions[0], ServerAction::CloseConnection { session_id, .. } if *session_id == sid(1)));
        assert!(!server.registry().is_live(sid(1)));
    }

    #[test]
    fn heartbeat_keeps_session_alive() {
        let (env, server) = driver(ServerConfig::default());
        connect(&server, 1);

        for _ in 0..5 {
            env.advance(Duration::from_secs(30));
            server.process_event(ServerEvent::HeartbeatReceived { session_id: sid(1) }).unwrap();
            server.process_event(ServerEvent::Tick).unwrap();
        }

        assert!(server.registry().is_live(sid(1)));
    }

    #[test]
    fn idle_authority_triggers_direct_join() {
        let (env, server) = driver(ServerConfig::default());
        connect(&server, 1);
        send(&server, 1, ClientMessage::RequestJoinRoom(room("r1")));

        env.advance(Duration::from_secs(61));
        connect(&server, 2);
        server.process_event(ServerEvent::Tick).unwrap();

        let actions = without_logs(send(&server, 2, ClientMessage::RequestJoinRoom(room("r1"))));

        assert!(actions.contains(&ServerAction::SendToSession {
            session_id: sid(2),
            message: ServerMessage::RoomJoined(RoomJoined {
                room_id: room("r1"),
                is_creator: false,
                message: crate::room_manager::JOINED_DIRECTLY.to_string(),
            }),
        }));
    }

    #[test]
    fn join_timeout_declines_on_tick() {
        let (env, server) = driver(ServerConfig {
            join_request_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        connect(&server, 1);
        connect(&server, 2);
        send(&server, 1, ClientMessage::RequestJoinRoom(room("r1")));
        send(&server, 2, ClientMessage::RequestJoinRoom(room("r1")));

        env.advance(Duration::from_secs(10));
        let actions = without_logs(server.process_event(ServerEvent::Tick).unwrap());

        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::SendToSession { session_id, message: ServerMessage::JoinDeclined(_) } if *session_id == sid(2)
        )));
    }
}
