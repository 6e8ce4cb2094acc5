//! Tracing/logging setup shared by every dispatch worker process.

/// Initialize process-wide logging with the default `info` filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Subscriber configuration (filters, formatting).
pub mod tracing;
