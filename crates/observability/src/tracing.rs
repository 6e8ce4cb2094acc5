//! Tracing/logging initialization.
//!
//! Workers log as JSON lines with timestamps. `RUST_LOG` overrides the
//! filter, e.g. `RUST_LOG=dispatch_infra=trace` to see empty polls.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing for the process, falling back to `default_filter`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_current_span(true)
        .try_init();
}
