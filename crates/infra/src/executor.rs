//! The execution loop: receive, dispatch, respond, repeat.
//!
//! ```text
//! AwaitingJob ─▶ Dispatching ─▶ Completing ─────┐
//!      ▲               └──────▶ ErrorReporting ─┤
//!      └────────────────────────────────────────┘
//! ```
//!
//! Any state can end in shutdown through [`ExecutorError::Quit`]. Jobs are
//! processed strictly one at a time on the calling thread.

use std::convert::Infallible;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, info, warn};

use batchexec_core::{DetectionComponent, ErrorCode, run_detection};
use batchexec_messaging::BrokerConnection;
use batchexec_observability::job_span;

use crate::health_check::{HealthCheck, HealthCheckError};
use crate::job_context::JobContext;
use crate::job_receiver::JobReceiver;
use crate::messenger::MessengerError;
use crate::shutdown::ShutdownCoordinator;

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const GENERIC_FAILURE: u8 = 1;
    pub const BROKER_CONNECTION_FAILURE: u8 = 37;
    pub const REGISTRATION_FAILURE: u8 = 38;
    pub const COMPONENT_LOAD_FAILURE: u8 = 39;
    pub const HEALTH_CHECK_FAILURE: u8 = 40;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Shutdown was requested; not a failure.
    #[error("quit requested")]
    Quit,

    #[error(transparent)]
    HealthCheck(#[from] HealthCheckError),

    #[error(transparent)]
    Messenger(MessengerError),
}

impl From<MessengerError> for ExecutorError {
    fn from(e: MessengerError) -> Self {
        match e {
            MessengerError::Quit => ExecutorError::Quit,
            other => ExecutorError::Messenger(other),
        }
    }
}

impl ExecutorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ExecutorError::Quit => exit_code::SUCCESS,
            ExecutorError::HealthCheck(_) => exit_code::HEALTH_CHECK_FAILURE,
            ExecutorError::Messenger(MessengerError::ConnectionInitialization(_)) => {
                exit_code::BROKER_CONNECTION_FAILURE
            }
            ExecutorError::Messenger(_) => exit_code::GENERIC_FAILURE,
        }
    }
}

/// What happened to one received job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(ErrorCode),
    Unsupported,
    /// Returned for redelivery because the health check failed.
    Rejected,
}

/// Loop runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub jobs_received: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_unsupported: u64,
    pub jobs_rejected: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: JobOutcome) {
        self.jobs_received += 1;
        match outcome {
            JobOutcome::Completed => self.jobs_completed += 1,
            JobOutcome::Failed(_) => self.jobs_failed += 1,
            JobOutcome::Unsupported => self.jobs_unsupported += 1,
            JobOutcome::Rejected => self.jobs_rejected += 1,
        }
    }
}

pub struct ExecutionLoop<C: BrokerConnection, D: DetectionComponent> {
    receiver: JobReceiver<C>,
    component: D,
    health_check: HealthCheck,
    stats: ExecutorStats,
}

impl<C: BrokerConnection, D: DetectionComponent> ExecutionLoop<C, D> {
    pub fn new(receiver: JobReceiver<C>, component: D, health_check: HealthCheck) -> Self {
        Self {
            receiver,
            component,
            health_check,
            stats: ExecutorStats::default(),
        }
    }

    /// Make the health check's post-failure wait end early on shutdown.
    pub fn with_shutdown_aware_health_check(mut self, shutdown: &ShutdownCoordinator) -> Self {
        let shutdown = shutdown.clone();
        self.health_check = self.health_check.with_sleeper(move |wait| {
            shutdown.sleep_unless_quit(wait);
        });
        self
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    pub fn component_mut(&mut self) -> &mut D {
        &mut self.component
    }

    /// Process jobs until shutdown or a fatal error.
    ///
    /// Only ever returns `Err`; [`ExecutorError::Quit`] is the clean case.
    pub fn run(&mut self) -> Result<Infallible, ExecutorError> {
        info!("waiting for jobs");
        loop {
            if let Err(e) = self.run_once() {
                match &e {
                    ExecutorError::Quit => info!(stats = ?self.stats, "execution loop stopped"),
                    other => error!(error = %other, stats = ?self.stats, "execution loop failed"),
                }
                return Err(e);
            }
        }
    }

    /// Receive and process exactly one job.
    pub fn run_once(&mut self) -> Result<JobOutcome, ExecutorError> {
        let mut ctx = self.receiver.get_job()?;
        let span = job_span(ctx.job_name());
        let _entered = span.enter();

        let outcome = self.process(&mut ctx)?;
        self.stats.record(outcome);
        Ok(outcome)
    }

    fn process(&mut self, ctx: &mut JobContext) -> Result<JobOutcome, ExecutorError> {
        if !self.passes_health_check()? {
            return Ok(JobOutcome::Rejected);
        }

        if !self.component.supports(ctx.job().data_type()) {
            warn!(data_type = %ctx.job().data_type(), "unsupported data type");
            self.receiver.report_unsupported_data_type(ctx)?;
            return Ok(JobOutcome::Unsupported);
        }

        ctx.mark_started();
        let component = &mut self.component;
        let job = ctx.job();
        let result = catch_unwind(AssertUnwindSafe(|| run_detection(component, job)));

        match result {
            Ok(Ok(results)) => {
                self.receiver.complete_job(ctx, &results)?;
                Ok(JobOutcome::Completed)
            }
            Ok(Err(failure)) => {
                let (code, message) = failure.to_report();
                self.receiver.report_job_error(ctx, code, &message)?;
                Ok(JobOutcome::Failed(code))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "component panicked");
                let code = ErrorCode::OtherDetectionErrorType;
                self.receiver
                    .report_job_error(ctx, code, &format!("Component panicked: {message}"))?;
                Ok(JobOutcome::Failed(code))
            }
        }
    }

    /// Run the health check; a failed check returns the current request for
    /// redelivery.
    fn passes_health_check(&mut self) -> Result<bool, ExecutorError> {
        let receiver = &mut self.receiver;
        let mut rejected = None;
        let healthy = self.health_check.check(&mut self.component, || {
            rejected = Some(receiver.reject_job());
        });

        match rejected {
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(())) => {}
            None if matches!(healthy, Ok(false)) => self.receiver.reject_job()?,
            None => {}
        }
        Ok(healthy?)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
