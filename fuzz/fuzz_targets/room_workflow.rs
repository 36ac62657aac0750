//! Fuzz target for the room workflow
//!
//! Replays arbitrary client operation sequences against the simulated server.
//!
//! # Invariants
//!
//! - A room's authority is always one of its members
//! - Empty rooms never survive
//! - The session-to-rooms index matches room membership
//! - Disconnect cleanup leaves no room holding a departed session

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_harness::{InvariantRegistry, Operation, Workload};
use tether_server::DriverConfig;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    clients: u8,
    with_timeout: bool,
    operations: Vec<Operation>,
}

fuzz_target!(|scenario: Scenario| {
    let config = DriverConfig {
        join_request_timeout: scenario
            .with_timeout
            .then(|| std::time::Duration::from_secs(30)),
        ..DriverConfig::default()
    };
    let slots = usize::from(scenario.clients % 8) + 1;
    let mut workload = Workload::new(slots, scenario.seed, config);
    let registry = InvariantRegistry::standard();

    for op in scenario.operations.iter().take(256) {
        let _ = workload.apply(op);
        registry.assert_all(&workload.server().snapshot(), &format!("after {op:?}"));
    }
});
