//! Environment abstraction for deterministic testing.
//!
//! Session identifiers, heartbeats, idle detection and join-request expiry
//! all depend on time or randomness. Routing them through this trait lets
//! the simulation harness replay a run from a seed with a virtual clock,
//! while production uses the system clock and OS entropy.

use std::time::Duration;

/// Time, randomness and sleeping, as seen by server logic.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses OS entropy in production
/// - Given the same seed, a simulated environment yields the same sequence
///   of random values
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; simulation uses a virtual
    /// instant advanced explicitly by the test.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only runtime code awaits this. Protocol logic takes time as a
    /// parameter instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for session identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
