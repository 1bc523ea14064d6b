//! Startup registration of the component with the workflow manager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument};

use batchexec_messaging::{BrokerConnection, BrokerMessage};

use crate::config::EnvLookup;
use crate::messenger::{Messenger, MessengerError};

/// Queue the descriptor is sent to.
pub const REGISTRATION_QUEUE: &str = "MPF.DETECTION_COMPONENT_REGISTRATION";

pub const DISABLE_COMPONENT_REGISTRATION_ENV: &str = "DISABLE_COMPONENT_REGISTRATION";
pub const DESCRIPTOR_PATH_ENV: &str = "DESCRIPTOR_PATH";
pub const COMPONENT_NAME_ENV: &str = "COMPONENT_NAME";
pub const MPF_HOME_ENV: &str = "MPF_HOME";

const DEFAULT_MPF_HOME: &str = "/opt/mpf";

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(
        "the \"DESCRIPTOR_PATH\" environment variable is set to \"{0}\", but that file does not exist"
    )]
    DescriptorPathMissing(PathBuf),

    #[error(
        "multiple descriptor files were found; set the \"DESCRIPTOR_PATH\" environment variable to the path of the descriptor that should be used"
    )]
    MultipleDescriptors,

    #[error(
        "could not find a descriptor file; set the \"DESCRIPTOR_PATH\" environment variable to the path of the descriptor file that should be used"
    )]
    NoDescriptor,

    #[error("failed to read descriptor \"{path}\": {source}")]
    ReadDescriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registration failed with response: {0}")]
    Rejected(String),

    #[error("registration failed with no details")]
    RejectedWithoutDetail,

    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

pub fn registration_disabled(lookup: EnvLookup<'_>) -> bool {
    lookup(DISABLE_COMPONENT_REGISTRATION_ENV)
        .is_some_and(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
}

/// Locate the component descriptor.
///
/// `DESCRIPTOR_PATH` wins (and must exist), then
/// `$MPF_HOME/plugins/$COMPONENT_NAME/descriptor/descriptor.json`, then the
/// only descriptor under `$MPF_HOME/plugins`.
pub fn find_descriptor(lookup: EnvLookup<'_>) -> Result<PathBuf, RegistrationError> {
    if let Some(path) = lookup(DESCRIPTOR_PATH_ENV) {
        let path = PathBuf::from(path);
        return if path.exists() {
            Ok(path)
        } else {
            Err(RegistrationError::DescriptorPathMissing(path))
        };
    }

    let plugins = PathBuf::from(lookup(MPF_HOME_ENV).unwrap_or_else(|| DEFAULT_MPF_HOME.to_string()))
        .join("plugins");

    if let Some(name) = lookup(COMPONENT_NAME_ENV) {
        let path = descriptor_in(&plugins.join(name));
        if path.exists() {
            return Ok(path);
        }
    }

    find_only_descriptor(&plugins)
}

fn descriptor_in(plugin_dir: &Path) -> PathBuf {
    plugin_dir.join("descriptor").join("descriptor.json")
}

fn find_only_descriptor(plugins: &Path) -> Result<PathBuf, RegistrationError> {
    let Ok(entries) = std::fs::read_dir(plugins) else {
        return Err(RegistrationError::NoDescriptor);
    };

    let mut first: Option<PathBuf> = None;
    for entry in entries.flatten() {
        let candidate = descriptor_in(&entry.path());
        if !candidate.exists() {
            continue;
        }
        match &first {
            None => first = Some(candidate),
            Some(existing) if same_file(existing, &candidate) => {}
            Some(_) => return Err(RegistrationError::MultipleDescriptors),
        }
    }
    first.ok_or(RegistrationError::NoDescriptor)
}

/// Symlinked plugin directories point at the same descriptor.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Send the descriptor and wait for the workflow manager's verdict.
///
/// Does nothing when `DISABLE_COMPONENT_REGISTRATION` is set to anything
/// other than `0` or `false`.
#[instrument(skip_all, err)]
pub fn register_component<C: BrokerConnection>(
    messenger: &Messenger<C>,
    lookup: EnvLookup<'_>,
    timeout: Option<Duration>,
) -> Result<(), RegistrationError> {
    if registration_disabled(lookup) {
        return Ok(());
    }

    let path = find_descriptor(lookup)?;
    let descriptor = std::fs::read_to_string(&path).map_err(|source| {
        RegistrationError::ReadDescriptor {
            path: path.clone(),
            source,
        }
    })?;
    info!(descriptor = %path.display(), "starting component registration");

    let reply = messenger.request_reply(REGISTRATION_QUEUE, BrokerMessage::text(descriptor), timeout)?;
    let success = reply.bool_property("success").unwrap_or(false);
    let detail = reply.string_property("detail");

    match (success, detail) {
        (true, Some(detail)) => {
            info!(response = %detail, "successfully registered component");
            Ok(())
        }
        (true, None) => {
            info!("successfully registered component");
            Ok(())
        }
        (false, Some(detail)) => Err(RegistrationError::Rejected(detail)),
        (false, None) => Err(RegistrationError::RejectedWithoutDetail),
    }
}
