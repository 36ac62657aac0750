//! Session registry and liveness tracking.
//!
//! The registry is the single source of truth for "is this session live".
//! A session is live while it is registered and its [`Connection`] is open.
//! An idle timeout closes the connection in place, so the session stops
//! being live immediately even though the transport has not yet reported
//! the socket as gone.
//!
//! Room membership is not tracked here. The reverse index lives in the
//! room store so it can be updated under the room lock.

use std::{
    collections::HashMap,
    fmt::Debug,
    ops::Sub,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tether_core::{Connection, ConnectionAction, ConnectionConfig, ConnectionError};
use tether_proto::SessionId;

/// Information about a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// When the connection was accepted
    pub connected_at: I,
    /// Liveness state machine for the connection
    pub connection: Connection<I>,
}

/// Outcome of trying to register a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Session registered
    Admitted,
    /// The identifier is already in use
    AlreadyRegistered,
    /// The registry holds `max_sessions` sessions
    AtCapacity,
}

/// Thread-safe map of live sessions.
#[derive(Debug)]
pub struct SessionRegistry<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    sessions: Mutex<HashMap<SessionId, SessionInfo<I>>>,
}

impl<I> Default for SessionRegistry<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> SessionRegistry<I>
where
    I: Copy + Ord + Debug + Sub<Output = Duration>,
{
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionInfo<I>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session if there is room for it.
    ///
    /// The capacity check and the insert happen under one lock, so
    /// concurrent accepts cannot overshoot `max_sessions`.
    pub fn register_session(
        &self,
        session_id: SessionId,
        now: I,
        config: ConnectionConfig,
        max_sessions: usize,
    ) -> Admission {
        let mut sessions = self.lock();
        if sessions.contains_key(&session_id) {
            return Admission::AlreadyRegistered;
        }
        if sessions.len() >= max_sessions {
            return Admission::AtCapacity;
        }

        let info = SessionInfo { connected_at: now, connection: Connection::new(now, config) };
        sessions.insert(session_id, info);
        Admission::Admitted
    }

    /// Remove a session. Returns its info if it was registered.
    pub fn unregister_session(&self, session_id: SessionId) -> Option<SessionInfo<I>> {
        let mut info = self.lock().remove(&session_id)?;
        info.connection.close();
        Some(info)
    }

    /// Check if a session is registered, open or not.
    pub fn has_session(&self, session_id: SessionId) -> bool {
        self.lock().contains_key(&session_id)
    }

    /// Point-in-time liveness check.
    pub fn is_live(&self, session_id: SessionId) -> bool {
        self.lock().get(&session_id).is_some_and(|info| info.connection.is_open())
    }

    /// Copy of one session's bookkeeping.
    pub fn session(&self, session_id: SessionId) -> Option<SessionInfo<I>> {
        self.lock().get(&session_id).cloned()
    }

    /// Record inbound traffic on a session.
    ///
    /// Returns `None` if the session is not registered.
    pub fn record_activity(
        &self,
        session_id: SessionId,
        now: I,
    ) -> Option<Result<(), ConnectionError>> {
        self.lock().get_mut(&session_id).map(|info| info.connection.record_activity(now))
    }

    /// Close a session's connection without unregistering it.
    ///
    /// Returns `false` if the session is not registered.
    pub fn close_session(&self, session_id: SessionId) -> bool {
        let mut sessions = self.lock();
        let Some(info) = sessions.get_mut(&session_id) else {
            return false;
        };
        info.connection.close();
        true
    }

    /// Run heartbeat and idle detection on every session.
    pub fn tick(&self, now: I) -> Vec<(SessionId, ConnectionAction)> {
        let mut sessions = self.lock();
        let mut actions = Vec::new();

        for (&session_id, info) in sessions.iter_mut() {
            actions.extend(info.connection.tick(now).into_iter().map(|action| (session_id, action)));
        }

        actions.sort_by_key(|(session_id, _)| *session_id);
        actions
    }

    /// Identifiers of all live sessions, in ascending order.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, info)| info.connection.is_open())
            .map(|(&session_id, _)| session_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Identifiers of all registered sessions, live or not, ascending.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    #[allow(clippy::disallowed_methods)]
    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn register_and_lookup_session() {
        let registry = SessionRegistry::new();
        let t0 = now();

        assert_eq!(
            registry.register_session(sid(1), t0, ConnectionConfig::default(), 10),
            Admission::Admitted
        );
        assert!(registry.has_session(sid(1)));
        assert!(registry.is_live(sid(1)));
        assert!(!registry.has_session(sid(2)));
        assert_eq!(registry.session(sid(1)).map(|info| info.connected_at), Some(t0));
    }

    #[test]
    fn register_duplicate_session_fails() {
        let registry = SessionRegistry::new();

        registry.register_session(sid(1), now(), ConnectionConfig::default(), 10);
        assert_eq!(
            registry.register_session(sid(1), now(), ConnectionConfig::default(), 10),
            Admission::AlreadyRegistered
        );
    }

    #[test]
    fn register_respects_capacity() {
        let registry = SessionRegistry::new();

        registry.register_session(sid(1), now(), ConnectionConfig::default(), 2);
        registry.register_session(sid(2), now(), ConnectionConfig::default(), 2);

        assert_eq!(
            registry.register_session(sid(3), now(), ConnectionConfig::default(), 2),
            Admission::AtCapacity
        );
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn unregister_makes_session_dead() {
        let registry = SessionRegistry::new();
        registry.register_session(sid(1), now(), ConnectionConfig::default(), 10);

        let info = registry.unregister_session(sid(1)).unwrap();

        assert!(!info.connection.is_open());
        assert!(!registry.is_live(sid(1)));
        assert!(registry.unregister_session(sid(1)).is_none());
    }

    #[test]
    fn closed_session_is_registered_but_not_live() {
        let registry = SessionRegistry::new();
        registry.register_session(sid(1), now(), ConnectionConfig::default(), 10);

        assert!(registry.close_session(sid(1)));

        assert!(registry.has_session(sid(1)));
        assert!(!registry.is_live(sid(1)));
        assert!(registry.live_sessions().is_empty());
        assert_eq!(registry.record_activity(sid(1), now()), Some(Err(ConnectionError::Closed)));
    }

    #[test]
    fn record_activity_on_unknown_session() {
        let registry: SessionRegistry<Instant> = SessionRegistry::new();
        assert_eq!(registry.record_activity(sid(9), now()), None);
    }

    #[test]
    fn tick_closes_idle_sessions() {
        let registry = SessionRegistry::new();
        let t0 = now();
        let config = ConnectionConfig {
            idle_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
        };
        registry.register_session(sid(1), t0, config.clone(), 10);
        registry.register_session(sid(2), t0, config, 10);
        registry.record_activity(sid(2), t0 + Duration::from_secs(4)).unwrap().unwrap();

        let actions = registry.tick(t0 + Duration::from_secs(6));

        assert!(matches!(actions[0], (id, ConnectionAction::Close { .. }) if id == sid(1)));
        assert_eq!(actions[1], (sid(2), ConnectionAction::SendPing));
        assert!(!registry.is_live(sid(1)));
        assert!(registry.is_live(sid(2)));
    }
}
