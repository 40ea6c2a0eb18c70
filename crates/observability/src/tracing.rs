//! Tracing/logging initialization.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Output encoding for log lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event (production default).
    #[default]
    Json,
    /// Human-readable single-line output.
    Pretty,
}

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub default_filter: String,
    pub format: LogFormat,
    /// Include the event target (module path) in each line.
    pub with_target: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
            with_target: false,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    // Configurable via RUST_LOG; try_init keeps repeated calls harmless.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.compact().try_init(),
    };
}

pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentjobs_engine=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
