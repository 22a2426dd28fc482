//! Tracing and logging setup shared by the binaries.

/// Install the process-wide subscriber: JSON output, `RUST_LOG` filter,
/// `info` when unset.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::Json, "info");
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use tracing::{LogFormat, ParseLogFormatError, init_with};
