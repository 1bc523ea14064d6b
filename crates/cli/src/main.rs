//! `batchexec`: runs one detection component against a broker request queue.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use batchexec_core::DetectionComponent;
use batchexec_infra::broker::RedisStreamsBroker;
use batchexec_infra::component::{
    ComponentLanguage, DEFAULT_INTERPRETER, load_component, start_component,
};
use batchexec_infra::registration::register_component;
use batchexec_infra::{
    ExecutionLoop, ExecutorConfig, ExecutorError, HealthCheck, JobReceiver, Messenger,
    MessengerError, RegistrationError, ResponsePacker, ShutdownCoordinator, exit_code,
};
use batchexec_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "batchexec", version, about = "Transactional batch detection executor")]
struct Args {
    /// Component to run: a built-in library name such as `libhello.so`, or a
    /// script for the subprocess adapter.
    library: String,

    /// Queue the component consumes detection requests from.
    request_queue: String,

    /// `native` or `subprocess`; inferred from the library extension when
    /// omitted.
    #[arg(long, env = "COMPONENT_LANGUAGE")]
    language: Option<ComponentLanguage>,

    #[arg(long, env = "AMQ_BROKER_URI", default_value = "redis://127.0.0.1:6379")]
    broker_uri: String,

    /// Consumer name within the request queue's group; keep it stable across
    /// restarts so unacknowledged requests are picked up again.
    #[arg(long, env = "HOSTNAME", default_value = "batchexec")]
    consumer: String,

    #[arg(long, env = "COMPONENT_INTERPRETER", default_value = DEFAULT_INTERPRETER)]
    interpreter: String,

    /// Seconds to wait for the registration reply; waits until shutdown when
    /// omitted.
    #[arg(long, env = "REGISTRATION_TIMEOUT")]
    registration_timeout: Option<u64>,

    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let args = Args::parse();
    batchexec_observability::init(args.log_format);
    ExitCode::from(run(&args))
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Directory holding the executable; plugins live next to it.
fn app_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("executable path has no parent directory")
}

fn run(args: &Args) -> u8 {
    let shutdown = ShutdownCoordinator::new();
    if let Err(e) = shutdown.install_signal_waiter() {
        error!(error = %e, "failed to install signal handling");
        return exit_code::GENERIC_FAILURE;
    }

    let config = match ExecutorConfig::from_env(&args.request_queue) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return exit_code::GENERIC_FAILURE;
        }
    };

    let broker = match RedisStreamsBroker::new(&args.broker_uri, &args.consumer) {
        Ok(broker) => broker,
        Err(e) => {
            error!(broker_uri = %args.broker_uri, error = %e, "invalid broker URI");
            return exit_code::BROKER_CONNECTION_FAILURE;
        }
    };
    let messenger = match Messenger::connect(&broker, &config.request_queue, &config.media_filter, &shutdown) {
        Ok(messenger) => messenger,
        Err(e) => {
            error!(broker_uri = %args.broker_uri, error = %e, "failed to connect to broker");
            return ExecutorError::from(e).exit_code();
        }
    };

    let timeout = args.registration_timeout.map(Duration::from_secs);
    match register_component(&messenger, &env, timeout) {
        Ok(()) => {}
        Err(RegistrationError::Messenger(MessengerError::Quit)) => {
            info!("shutdown requested during component registration");
            return exit_code::SUCCESS;
        }
        Err(e) => {
            error!(error = %e, "component registration failed");
            return exit_code::REGISTRATION_FAILURE;
        }
    }

    let language = ComponentLanguage::resolve(args.language, &args.library);
    let mut component = match load_component(&args.library, language, &args.interpreter) {
        Ok(component) => component,
        Err(e) => {
            error!(library = %args.library, %language, error = %e, "failed to load detection component");
            return exit_code::COMPONENT_LOAD_FAILURE;
        }
    };
    let started = app_dir()
        .map_err(|e| format!("{e:#}"))
        .and_then(|dir| start_component(component.as_mut(), &dir).map_err(|e| e.to_string()));
    if let Err(e) = started {
        error!(library = %args.library, error = %e, "failed to start detection component");
        return exit_code::COMPONENT_LOAD_FAILURE;
    }

    let health_check = match HealthCheck::from_settings(&config.health_check, &env) {
        Ok(health_check) => health_check,
        Err(e) => {
            error!(error = %e, "failed to load health check");
            component.close();
            return exit_code::GENERIC_FAILURE;
        }
    };

    let receiver = JobReceiver::new(
        messenger,
        ResponsePacker::with_max_response_bytes(config.max_response_bytes),
        config.job_properties.clone(),
        component.detection_type(),
    );
    let mut executor =
        ExecutionLoop::new(receiver, component, health_check).with_shutdown_aware_health_check(&shutdown);

    let mut code = match executor.run() {
        Ok(never) => match never {},
        Err(e) => e.exit_code(),
    };

    if !executor.component_mut().close() {
        warn!("detection component failed to close");
        if code == exit_code::SUCCESS {
            code = exit_code::GENERIC_FAILURE;
        }
    }
    info!(exit_code = code, "executor exiting");
    code
}
