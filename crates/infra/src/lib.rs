//! Infrastructure layer: broker session, job intake, health checks,
//! component loading and the execution loop.

pub mod broker;
pub mod component;
pub mod config;
pub mod executor;
pub mod health_check;
pub mod job_context;
pub mod job_receiver;
pub mod messenger;
pub mod registration;
pub mod response_packer;
pub mod shutdown;
pub mod signal;

pub use config::{ConfigError, EnvLookup, ExecutorConfig, HealthCheckSettings};
pub use executor::{ExecutionLoop, ExecutorError, ExecutorStats, JobOutcome, exit_code};
pub use health_check::{HealthCheck, HealthCheckError, HealthCheckJob, HealthCheckLoadError};
pub use job_context::JobContext;
pub use job_receiver::{JobReceiveError, JobReceiver};
pub use messenger::{Messenger, MessengerError};
pub use registration::{RegistrationError, register_component};
pub use response_packer::{PackError, ResponsePacker};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

mod integration_tests;
