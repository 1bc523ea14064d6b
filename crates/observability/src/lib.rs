//! Tracing and logging setup shared by the executor binary and its tests.

/// Initialize process-wide logging in the given format.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

/// Spans that tag log lines with the current job.
pub mod span;

pub use span::{HEALTH_CHECK_SPAN_NAME, job_span};
pub use tracing::{LogFormat, UnknownLogFormat};
