//! Tracing and logging (shared setup).

pub use crate::tracing::{LogFormat, ObservabilityConfig, ParseLogFormatError};

/// Initialize process-wide tracing from `RUST_LOG` / `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&ObservabilityConfig::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
