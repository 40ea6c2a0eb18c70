//! Process-wide tracing setup shared by engine hosts and tests.

/// Install the global subscriber described by `config`.
///
/// Only the first call in a process installs anything; later calls return
/// without effect.
pub fn init(config: &ObservabilityConfig) {
    tracing::init(config);
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber construction (filter, output format).
pub mod tracing;

pub use tracing::{LogFormat, ObservabilityConfig};
