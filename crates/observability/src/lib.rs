//! Tracing and logging setup shared by the binary and tests.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogOutput;

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(output: LogOutput) {
    self::tracing::init(output);
}
