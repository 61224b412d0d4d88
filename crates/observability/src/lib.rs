//! Process-wide tracing setup shared by binaries and test harnesses.

pub mod subscriber;

pub use subscriber::{LogFormat, ObservabilityConfig};

/// Initialize tracing from the environment (`RUST_LOG`, `LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    subscriber::init(&ObservabilityConfig::from_env());
}
