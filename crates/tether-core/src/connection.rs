//! Per-connection liveness state machine.
//!
//! Tracks inbound activity, schedules heartbeats and detects idle peers.
//! Methods take the current time as input and return actions for the driver
//! to execute, so the machine stays pure and is tested without a clock.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   idle timeout / close()   ┌────────┐
//! │ Open │───────────────────────────>│ Closed │
//! └──────┘                            └────────┘
//!    │ ↑
//!    │ └── any inbound frame or pong resets the idle clock
//!    └──── every heartbeat_interval: SendPing
//! ```

use std::{
    fmt::Debug,
    ops::Sub,
    time::{Duration, Instant},
};

use crate::error::ConnectionError;

/// Maximum time without inbound traffic before the connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between server pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send a transport-level ping to the peer
    SendPing,

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting traffic
    Open,
    /// Closed by timeout or explicitly
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_IDLE_TIMEOUT, heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL }
    }
}

/// Liveness tracking for a single connection.
///
/// Generic over `Instant` so the harness can drive it with virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    last_heartbeat: I,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// Create an open connection whose idle clock starts at `now`.
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self { state: ConnectionState::Open, config, last_activity: now, last_heartbeat: now }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True while the connection accepts traffic.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Time of the most recent inbound traffic.
    pub fn last_activity(&self) -> I {
        self.last_activity
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Record inbound traffic (a frame or a pong).
    ///
    /// # Errors
    ///
    /// `ConnectionError::Closed` if the connection was already closed, for
    /// example by an idle timeout that raced with the frame.
    pub fn record_activity(&mut self, now: I) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        if now > self.last_activity {
            self.last_activity = now;
        }
        Ok(())
    }

    /// Elapsed silence, if it exceeds the idle timeout.
    pub fn check_timeout(&self, now: I) -> Option<ConnectionError> {
        if self.state == ConnectionState::Closed {
            return None;
        }

        let elapsed = now - self.last_activity;
        if elapsed > self.config.idle_timeout {
            Some(ConnectionError::IdleTimeout { elapsed })
        } else {
            None
        }
    }

    /// Periodic maintenance: idle detection, then heartbeat.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }

        if let Some(err) = self.check_timeout(now) {
            self.close();
            return vec![ConnectionAction::Close { reason: err.to_string() }];
        }

        if now - self.last_heartbeat >= self.config.heartbeat_interval {
            self.last_heartbeat = now;
            return vec![ConnectionAction::SendPing];
        }

        Vec::new()
    }
}
