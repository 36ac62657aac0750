//! Tether production server.
//!
//! WebRTC signaling relay: clients meet in named rooms, the room's authority
//! approves newcomers, and SDP offers, answers and ICE candidates are relayed
//! between members. Media never passes through the server.
//!
//! # Architecture
//!
//! [`ServerDriver`] is Sans-IO: events go in, actions come out. [`Server`]
//! executes those actions over WebSocket connections using Tokio, system time
//! and OS randomness.
//!
//! # Components
//!
//! - [`ServerDriver`]: Action-based orchestrator (pure logic, no I/O)
//! - [`RoomManager`]: Join workflow, signaling relay and departure handling
//! - [`RoomStore`]: Sharded room state with a session-to-rooms index
//! - [`SessionRegistry`]: Connected sessions and their liveness
//! - [`Server`]: Production runtime that executes `ServerDriver` actions
//! - [`WsTransport`]: WebSocket transport over TCP
//! - [`SystemEnv`]: Production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod departure;
mod driver;
mod error;
mod join;
mod registry;
mod room_manager;
mod room_store;
mod server_error;
mod system_env;
mod transport;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

pub use driver::{LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
use futures_util::{SinkExt, StreamExt};
pub use registry::{Admission, SessionInfo, SessionRegistry};
pub use room_manager::{
    ALREADY_IN_ROOM, AWAITING_APPROVAL, JOIN_ACCEPTED, JOIN_DECLINED, JOIN_TIMED_OUT,
    JOINED_DIRECTLY, ROOM_CREATED, ROOM_GONE, RoomAction, RoomManager,
};
pub use room_store::{Removal, Room, RoomError, RoomSlot, RoomStore};
pub use server_error::ServerError as DriverError;
pub use system_env::SystemEnv;
use tether_core::Environment;
use tether_proto::{ClientMessage, ProtocolError, SessionId};
use tokio::{
    net::TcpStream,
    sync::{Notify, RwLock, mpsc},
};
use tokio_tungstenite::tungstenite::{
    Message, Utf8Bytes,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
pub use transport::{WsStream, WsTransport};

/// Production driver type.
type Driver = ServerDriver<SystemEnv>;

/// Outbound half of one connection.
struct Peer {
    /// Frames queued for the connection's writer task
    outbound: mpsc::UnboundedSender<Message>,
    /// Wakes the reader loop when the server closes the connection
    shutdown: Arc<Notify>,
}

/// Shared state for all connections.
///
/// Maps each session to its writer queue. Every frame for a session goes
/// through that single queue, so per-session delivery order is the order in
/// which actions were executed.
struct SharedState {
    peers: RwLock<HashMap<SessionId, Peer>>,
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:5001")
    pub bind_address: String,
    /// How often the driver is ticked for heartbeats and expiry
    pub tick_interval: Duration,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5001".to_string(),
            tick_interval: Duration::from_secs(1),
            driver: DriverConfig::default(),
        }
    }
}

/// Production Tether server.
///
/// Wraps `ServerDriver` with WebSocket transport and system environment.
pub struct Server {
    /// The action-based server driver
    driver: Arc<Driver>,
    /// TCP listener
    transport: WsTransport,
    /// Environment
    env: SystemEnv,
    /// Period of the driver tick
    tick_interval: Duration,
}

impl Server {
    /// Create and bind a new server.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.tick_interval.is_zero() {
            return Err(ServerError::Config("tick interval must be non-zero".to_string()));
        }

        let env = SystemEnv::new();
        let driver = Arc::new(ServerDriver::new(env.clone(), config.driver));
        let transport = WsTransport::bind(&config.bind_address).await?;

        Ok(Self { driver, transport, env, tick_interval: config.tick_interval })
    }

    /// Run the server, accepting connections and processing messages.
    ///
    /// This method runs until the task is dropped. Per-connection failures
    /// are logged and never end the accept loop.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let shared = Arc::new(SharedState { peers: RwLock::new(HashMap::new()) });

        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&self.driver),
            Arc::clone(&shared),
            self.tick_interval,
        ));
        let _ticker = AbortOnDrop(ticker);

        loop {
            match self.transport.accept().await {
                Ok((stream, remote)) => {
                    let driver = Arc::clone(&self.driver);
                    let shared = Arc::clone(&shared);
                    let env = self.env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, driver, shared, env).await {
                            tracing::debug!("Connection from {} ended with error: {}", remote, e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// The driver executing this server's logic.
    pub fn driver(&self) -> &ServerDriver<SystemEnv> {
        &self.driver
    }
}

/// Aborts the wrapped task when the server loop is dropped.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Feed `Tick` events to the driver at a fixed period.
async fn run_ticker(driver: Arc<Driver>, shared: Arc<SharedState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match driver.process_event(ServerEvent::Tick) {
            Ok(actions) => execute_actions(actions, &shared).await,
            Err(e) => tracing::error!("Tick failed: {}", e),
        }
    }
}

/// Handle a single WebSocket connection from upgrade to cleanup.
async fn handle_connection(
    stream: TcpStream,
    driver: Arc<Driver>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let ws = transport::upgrade(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let shutdown = Arc::new(Notify::new());

    let writer = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session_id = loop {
        let candidate = SessionId::new(env.random_u64());
        {
            let mut peers = shared.peers.write().await;
            if peers.contains_key(&candidate) {
                continue;
            }
            peers.insert(
                candidate,
                Peer { outbound: outbound.clone(), shutdown: Arc::clone(&shutdown) },
            );
        }

        match driver.process_event(ServerEvent::ConnectionAccepted { session_id: candidate }) {
            Ok(actions) => {
                execute_actions(actions, &shared).await;
                break candidate;
            },
            Err(DriverError::SessionAlreadyExists(_)) => {
                shared.peers.write().await.remove(&candidate);
            },
            Err(e) => {
                shared.peers.write().await.remove(&candidate);
                return Err(e.into());
            },
        }
    };
    drop(outbound);

    tracing::debug!("New connection: {}", session_id);

    let reason = loop {
        let frame = tokio::select! {
            frame = source.next() => frame,
            () = shutdown.notified() => break "closed by server".to_string(),
        };

        let event = match frame {
            Some(Ok(Message::Text(text))) => match ClientMessage::decode(text.as_str()) {
                Ok(message) => ServerEvent::MessageReceived { session_id, message },
                Err(error) => ServerEvent::InvalidMessage { session_id, error },
            },
            Some(Ok(Message::Binary(_))) => ServerEvent::InvalidMessage {
                session_id,
                error: ProtocolError::Malformed("binary frames are not supported".to_string()),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                ServerEvent::HeartbeatReceived { session_id }
            },
            Some(Ok(Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break "closed by peer".to_string(),
            Some(Err(e)) => break format!("transport error: {e}"),
        };

        match driver.process_event(event) {
            Ok(actions) => execute_actions(actions, &shared).await,
            Err(e) => tracing::warn!("Message processing error for {}: {}", session_id, e),
        }
    };

    shared.peers.write().await.remove(&session_id);

    let actions = driver.process_event(ServerEvent::ConnectionClosed { session_id, reason })?;
    execute_actions(actions, &shared).await;

    let _ = writer.await;

    Ok(())
}

/// Execute server actions.
///
/// Delivery is fire-and-forget: a message for a session whose connection is
/// already gone is dropped.
async fn execute_actions(actions: Vec<ServerAction<std::time::Instant>>, shared: &SharedState) {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, message } => {
                let Some(text) = encode(&message) else { continue };
                let peers = shared.peers.read().await;
                if let Some(peer) = peers.get(&session_id) {
                    let _ = peer.outbound.send(Message::Text(text));
                } else {
                    tracing::debug!("SendToSession: session {} not connected", session_id);
                }
            },

            ServerAction::Broadcast { recipients, message } => {
                let Some(text) = encode(&message) else { continue };
                let peers = shared.peers.read().await;
                for session_id in recipients {
                    if let Some(peer) = peers.get(&session_id) {
                        let _ = peer.outbound.send(Message::Text(text.clone()));
                    }
                }
            },

            ServerAction::SendPing { session_id } => {
                let peers = shared.peers.read().await;
                if let Some(peer) = peers.get(&session_id) {
                    let _ = peer.outbound.send(Message::Ping(Default::default()));
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!("Closing connection {}: {}", session_id, reason);
                let peers = shared.peers.read().await;
                if let Some(peer) = peers.get(&session_id) {
                    let frame = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
                    let _ = peer.outbound.send(Message::Close(Some(frame)));
                    peer.shutdown.notify_one();
                }
            },

            ServerAction::Log { level, message, .. } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

fn encode(message: &tether_proto::ServerMessage) -> Option<Utf8Bytes> {
    match message.encode() {
        Ok(text) => Some(text.into()),
        Err(e) => {
            tracing::error!("Failed to encode {}: {}", message.kind(), e);
            None
        },
    }
}
