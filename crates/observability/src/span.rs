use tracing::{Span, info_span};

/// Job name used for the health-check canary span.
pub const HEALTH_CHECK_SPAN_NAME: &str = "Health check";

/// Span tagging every event emitted while `job_name` is processed.
///
/// Enter it (`let _guard = job_span(name).entered();`) for the lifetime of
/// the job.
pub fn job_span(job_name: &str) -> Span {
    info_span!("job", name = %job_name)
}
