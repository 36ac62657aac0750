//! In-memory server runner for deterministic tests.
//!
//! `SimServer` owns a real `ServerDriver` running under [`SimEnv`] and plays
//! the part of the production runtime: it feeds events in and executes the
//! returned actions against per-session outboxes instead of sockets.
//!
//! Action execution mirrors the runtime. Messages for a session whose socket
//! is gone are dropped, and `CloseConnection` is followed by the
//! `ConnectionClosed` event the runtime would produce.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    time::Duration,
};

use tether_core::Environment;
use tether_proto::{ClientMessage, ServerMessage, SessionId};
use tether_server::{
    DriverConfig, DriverError, LogLevel, ServerAction, ServerDriver, ServerEvent,
};

use crate::{
    SimEnv, SimInstant,
    invariants::{InvariantRegistry, SystemSnapshot, Violation},
};

/// One message handed to one session, in global delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Receiving session
    pub recipient: SessionId,
    /// What it received
    pub message: ServerMessage,
}

/// Simulation server for testing.
///
/// Tests drive it explicitly; nothing happens between calls.
pub struct SimServer {
    driver: ServerDriver<SimEnv>,
    env: SimEnv,
    /// Sessions whose simulated socket is open
    connected: BTreeSet<SessionId>,
    outboxes: BTreeMap<SessionId, Vec<ServerMessage>>,
    deliveries: Vec<Delivery>,
    pings: BTreeMap<SessionId, usize>,
    closed: BTreeMap<SessionId, String>,
    logs: Vec<(LogLevel, String)>,
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimServer {
    /// Server with default configuration and seed zero.
    pub fn new() -> Self {
        Self::with_config(DriverConfig::default())
    }

    /// Server with custom configuration and seed zero.
    pub fn with_config(config: DriverConfig) -> Self {
        Self::with_seed(0, config)
    }

    /// Server with an explicit seed.
    pub fn with_seed(seed: u64, config: DriverConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let driver = ServerDriver::new(env.clone(), config);

        Self {
            driver,
            env,
            connected: BTreeSet::new(),
            outboxes: BTreeMap::new(),
            deliveries: Vec::new(),
            pings: BTreeMap::new(),
            closed: BTreeMap::new(),
            logs: Vec::new(),
        }
    }

    /// Open a connection and return the session identifier it was given.
    ///
    /// A connection refused at capacity still gets an identifier; it shows
    /// up in [`closed_reason`](Self::closed_reason) immediately.
    pub fn connect(&mut self) -> SessionId {
        let session_id = loop {
            let candidate = SessionId::new(self.env.random_u64());
            if !self.connected.contains(&candidate)
                && !self.closed.contains_key(&candidate)
                && !self.driver.registry().has_session(candidate)
            {
                break candidate;
            }
        };

        self.connected.insert(session_id);
        self.process(ServerEvent::ConnectionAccepted { session_id })
            .unwrap_or_else(|e| tracing::warn!("accept failed for {session_id}: {e}"));

        session_id
    }

    /// Deliver a decoded client message.
    pub fn send(&mut self, session_id: SessionId, message: ClientMessage) -> Result<(), DriverError> {
        self.process(ServerEvent::MessageReceived { session_id, message })
    }

    /// Deliver a raw text frame, decoding it the way the runtime does.
    pub fn send_text(&mut self, session_id: SessionId, text: &str) -> Result<(), DriverError> {
        let event = match ClientMessage::decode(text) {
            Ok(message) => ServerEvent::MessageReceived { session_id, message },
            Err(error) => ServerEvent::InvalidMessage { session_id, error },
        };
        self.process(event)
    }

    /// Deliver a pong from the client.
    pub fn heartbeat(&mut self, session_id: SessionId) -> Result<(), DriverError> {
        self.process(ServerEvent::HeartbeatReceived { session_id })
    }

    /// Close a connection from the client side and run cleanup.
    pub fn disconnect(&mut self, session_id: SessionId) {
        self.connected.remove(&session_id);
        self.process(ServerEvent::ConnectionClosed {
            session_id,
            reason: "closed by peer".to_string(),
        })
        .unwrap_or_else(|e| tracing::warn!("close failed for {session_id}: {e}"));
    }

    /// Break a connection without running cleanup yet.
    ///
    /// The session stops being live but stays registered and keeps its room
    /// memberships, as happens between a socket dying and the runtime
    /// noticing. Follow with [`disconnect`](Self::disconnect) to clean up.
    pub fn drop_silently(&mut self, session_id: SessionId) {
        self.connected.remove(&session_id);
        self.driver.registry().close_session(session_id);
    }

    /// Move the virtual clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.env.advance(by);
    }

    /// Run one driver tick.
    pub fn tick(&mut self) {
        self.process(ServerEvent::Tick)
            .unwrap_or_else(|e| tracing::warn!("tick failed: {e}"));
    }

    /// Messages received by a session since its outbox was last taken.
    pub fn outbox(&self, session_id: SessionId) -> &[ServerMessage] {
        self.outboxes.get(&session_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Take and clear a session's outbox.
    pub fn take_outbox(&mut self, session_id: SessionId) -> Vec<ServerMessage> {
        self.outboxes.remove(&session_id).unwrap_or_default()
    }

    /// Clear every outbox. The delivery log is kept.
    pub fn clear_outboxes(&mut self) {
        self.outboxes.clear();
    }

    /// Every delivery so far, in order.
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Pings sent to a session.
    pub fn pings(&self, session_id: SessionId) -> usize {
        self.pings.get(&session_id).copied().unwrap_or(0)
    }

    /// Why the server closed a session's connection, if it did.
    pub fn closed_reason(&self, session_id: SessionId) -> Option<&str> {
        self.closed.get(&session_id).map(String::as_str)
    }

    /// Whether the session's simulated socket is open.
    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.connected.contains(&session_id)
    }

    /// Log lines emitted by the driver.
    pub fn logs(&self) -> &[(LogLevel, String)] {
        &self.logs
    }

    /// The driver under test.
    pub fn driver(&self) -> &ServerDriver<SimEnv> {
        &self.driver
    }

    /// The simulated environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Observable state for invariant checks.
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::capture(&self.driver)
    }

    /// Run the standard invariants against the current state.
    pub fn check_invariants(&self) -> Result<(), Vec<Violation>> {
        InvariantRegistry::standard().check_all(&self.snapshot())
    }

    fn process(&mut self, event: ServerEvent) -> Result<(), DriverError> {
        let actions = self.driver.process_event(event)?;
        self.execute(actions);
        Ok(())
    }

    fn execute(&mut self, actions: Vec<ServerAction<SimInstant>>) {
        let mut queue: VecDeque<_> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                ServerAction::SendToSession { session_id, message } => {
                    self.deliver(session_id, message);
                },

                ServerAction::Broadcast { recipients, message } => {
                    for session_id in recipients {
                        self.deliver(session_id, message.clone());
                    }
                },

                ServerAction::SendPing { session_id } => {
                    if self.connected.contains(&session_id) {
                        *self.pings.entry(session_id).or_default() += 1;
                    }
                },

                ServerAction::CloseConnection { session_id, reason } => {
                    if !self.connected.remove(&session_id) {
                        continue;
                    }
                    self.closed.insert(session_id, reason.clone());
                    match self.driver.process_event(ServerEvent::ConnectionClosed { session_id, reason })
                    {
                        Ok(more) => queue.extend(more),
                        Err(e) => tracing::warn!("close failed for {session_id}: {e}"),
                    }
                },

                ServerAction::Log { level, message, .. } => {
                    tracing::debug!(?level, "{message}");
                    self.logs.push((level, message));
                },
            }
        }
    }

    fn deliver(&mut self, recipient: SessionId, message: ServerMessage) {
        if !self.connected.contains(&recipient) {
            return;
        }
        self.outboxes.entry(recipient).or_default().push(message.clone());
        self.deliveries.push(Delivery { recipient, message });
    }
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer")
            .field("driver", &self.driver)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}
