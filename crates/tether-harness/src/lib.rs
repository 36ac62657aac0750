//! Deterministic simulation harness for Tether signaling tests.
//!
//! [`SimServer`] runs the real [`tether_server::ServerDriver`] under
//! [`SimEnv`] (seeded RNG, virtual clock) and collects everything each
//! session would have received in a per-session outbox. No sockets, no
//! wall-clock time: a seed and an operation sequence fully determine a run.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold after every
//! operation, whatever the sequence. Use [`InvariantRegistry::standard()`]
//! for the room invariants.
//!
//! # Model-Based Testing
//!
//! [`Operation`] describes one client or clock action. Property tests and
//! fuzz targets generate sequences of them and replay them through a
//! [`Workload`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod model;
pub mod sim_env;
pub mod sim_server;

pub use invariants::{
    AuthorityIsMember, Invariant, InvariantRegistry, InvariantResult, MembersAreConnected,
    MembershipIndexConsistent, NoEmptyRooms, PendingNotMember, RoomSnapshot, SystemSnapshot,
    Violation,
};
pub use model::{ClientId, ModelRoomId, Operation, SignalKind, Workload};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::{Delivery, SimServer};
