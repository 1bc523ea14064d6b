//! Environment-driven executor configuration.
//!
//! Every reader takes an [`EnvLookup`] instead of touching the process
//! environment directly, so settings can be built from any source.

pub mod env_interpolation;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use batchexec_core::Properties;
use batchexec_messaging::{MediaTypeFilter, RESTRICT_MEDIA_TYPES_ENV, SelectorError};

use crate::response_packer::DEFAULT_MAX_RESPONSE_BYTES;

pub use env_interpolation::{interpolate_env_vars, interpolate_file_content};

/// Variable lookup, usually `|name| std::env::var(name).ok()`.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Prefix of environment variables that become job properties.
pub const JOB_PROPERTY_PREFIX: &str = "MPF_PROP_";

pub const HEALTH_CHECK_ENV: &str = "HEALTH_CHECK";
pub const HEALTH_CHECK_TIMEOUT_ENV: &str = "HEALTH_CHECK_TIMEOUT";
pub const HEALTH_CHECK_RETRY_MAX_ATTEMPTS_ENV: &str = "HEALTH_CHECK_RETRY_MAX_ATTEMPTS";
pub const HEALTH_CHECK_FILE_ENV: &str = "HEALTH_CHECK_FILE";

/// Used when `HEALTH_CHECK_FILE` is unset.
pub const DEFAULT_HEALTH_CHECK_FILE: &str =
    "${MPF_HOME:-/opt/mpf}/plugins/${COMPONENT_NAME}/health/health-check.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the \"{name}\" environment variable did not contain a number: \"{value}\"")]
    NotANumber { name: &'static str, value: String },

    #[error(transparent)]
    MediaTypes(#[from] SelectorError),

    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
}

/// Job properties supplied through `MPF_PROP_<NAME>` variables.
pub fn environment_job_properties<I>(vars: I) -> Properties
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(JOB_PROPERTY_PREFIX)
                .filter(|stripped| !stripped.is_empty())
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

/// Health check tuning read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    /// Minimum time between checks. `None` checks before every job.
    pub cooldown: Option<Duration>,
    /// Consecutive failures before the check becomes fatal. `None` is never
    /// fatal.
    pub max_attempts: Option<u32>,
    /// Path of the canary job description, before variable expansion.
    pub file: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown: None,
            max_attempts: None,
            file: DEFAULT_HEALTH_CHECK_FILE.to_string(),
        }
    }
}

impl HealthCheckSettings {
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let enabled = match lookup(HEALTH_CHECK_ENV) {
            None => false,
            Some(mode) => {
                let mode = mode.trim();
                if ["ENABLED", "TRUE", "1"]
                    .iter()
                    .any(|accepted| mode.eq_ignore_ascii_case(accepted))
                {
                    info!("enabling health checks");
                    true
                } else {
                    warn!(mode, "unknown health check mode; disabling health checks");
                    false
                }
            }
        };

        if !enabled {
            return Ok(Self::default());
        }

        let max_attempts = positive_number(lookup, HEALTH_CHECK_RETRY_MAX_ATTEMPTS_ENV)?;
        if max_attempts.is_none() {
            warn!(
                variable = HEALTH_CHECK_RETRY_MAX_ATTEMPTS_ENV,
                "no positive value provided; the component will never exit because of failed health checks"
            );
        }
        let cooldown = positive_number(lookup, HEALTH_CHECK_TIMEOUT_ENV)?
            .map(|secs| Duration::from_secs(u64::from(secs)));
        if cooldown.is_none() {
            warn!(
                variable = HEALTH_CHECK_TIMEOUT_ENV,
                "no positive value provided; a health check will run before each job"
            );
        }

        Ok(Self {
            enabled,
            cooldown,
            max_attempts,
            file: lookup(HEALTH_CHECK_FILE_ENV)
                .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_FILE.to_string()),
        })
    }
}

/// Absent or non-positive values mean "not set".
fn positive_number(lookup: EnvLookup<'_>, name: &'static str) -> Result<Option<u32>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let value: i64 = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        name,
        value: raw.clone(),
    })?;
    Ok(u32::try_from(value).ok().filter(|v| *v > 0))
}

/// Everything the execution loop needs besides the component.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub request_queue: String,
    pub media_filter: MediaTypeFilter,
    pub job_properties: Properties,
    pub health_check: HealthCheckSettings,
    pub max_response_bytes: usize,
}

impl ExecutorConfig {
    /// Read from the process environment.
    pub fn from_env(request_queue: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_sources(
            request_queue,
            &|name: &str| std::env::var(name).ok(),
            std::env::vars(),
        )
    }

    pub fn from_sources<I>(
        request_queue: impl Into<String>,
        lookup: EnvLookup<'_>,
        vars: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let media_filter = MediaTypeFilter::parse(lookup(RESTRICT_MEDIA_TYPES_ENV).as_deref())?;
        Ok(Self {
            request_queue: request_queue.into(),
            media_filter,
            job_properties: environment_job_properties(vars),
            health_check: HealthCheckSettings::from_lookup(lookup)?,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        })
    }
}
