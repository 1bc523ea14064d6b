//! Component loading and lifecycle.
//!
//! The executor talks to every component through
//! [`DetectionComponent`]. Which adapter backs it is decided once, at
//! startup, from the library path and the requested language:
//!
//! - **native**: a component compiled into this binary, looked up by library
//!   name in the [`builtin`] registry
//! - **subprocess**: an out-of-process component driven over JSON lines
//!   ([`subprocess`])

pub mod builtin;
pub mod subprocess;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{error, info, warn};

use batchexec_core::DetectionComponent;

pub use builtin::{HelloComponent, builtin_component, builtin_names};
pub use subprocess::SubprocessComponent;

/// Interpreter used for subprocess components when none is configured.
pub const DEFAULT_INTERPRETER: &str = "python3";

#[derive(Debug, thiserror::Error)]
pub enum ComponentLoadError {
    #[error("no built-in component named \"{name}\" (available: {})", .available.join(", "))]
    UnknownBuiltin {
        name: String,
        available: Vec<&'static str>,
    },

    #[error("component file \"{0}\" does not exist")]
    MissingLibrary(PathBuf),

    #[error("detection component initialization failed")]
    InitFailed,

    #[error("unknown component language \"{0}\"; expected \"native\" or \"subprocess\"")]
    UnknownLanguage(String),
}

/// How the component is hosted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComponentLanguage {
    Native,
    Subprocess,
}

impl FromStr for ComponentLanguage {
    type Err = ComponentLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "rust" | "c++" => Ok(ComponentLanguage::Native),
            "subprocess" | "python" => Ok(ComponentLanguage::Subprocess),
            _ => Err(ComponentLoadError::UnknownLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for ComponentLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComponentLanguage::Native => "native",
            ComponentLanguage::Subprocess => "subprocess",
        })
    }
}

impl ComponentLanguage {
    /// Use `explicit` when given, otherwise guess from the library
    /// extension: anything with `so` in it is native.
    pub fn resolve(explicit: Option<ComponentLanguage>, library: &str) -> Self {
        if let Some(language) = explicit {
            return language;
        }
        if extension(library).to_ascii_lowercase().contains("so") {
            warn!(library, "no component language given; assuming native because of the .so extension");
            ComponentLanguage::Native
        } else {
            warn!(library, "no component language given; assuming subprocess because there is no .so extension");
            ComponentLanguage::Subprocess
        }
    }
}

/// Everything after the first `.` of the file name.
fn extension(path: &str) -> &str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    file_name.split_once('.').map(|(_, ext)| ext).unwrap_or("")
}

/// Name used to look a native library up in the built-in registry:
/// `/opt/plugins/Hello/lib/libhello.so` becomes `hello`.
pub fn builtin_name(library: &str) -> String {
    let file_name = library.rsplit('/').next().unwrap_or(library);
    let stem = file_name.split('.').next().unwrap_or(file_name);
    stem.strip_prefix("lib").unwrap_or(stem).to_ascii_lowercase()
}

/// Instantiate the component behind `library`.
pub fn load_component(
    library: &str,
    language: ComponentLanguage,
    interpreter: &str,
) -> Result<Box<dyn DetectionComponent>, ComponentLoadError> {
    match language {
        ComponentLanguage::Native => {
            let name = builtin_name(library);
            builtin_component(&name).ok_or_else(|| ComponentLoadError::UnknownBuiltin {
                name,
                available: builtin_names(),
            })
        }
        ComponentLanguage::Subprocess => {
            let script = PathBuf::from(library);
            if !script.exists() {
                return Err(ComponentLoadError::MissingLibrary(script));
            }
            Ok(Box::new(SubprocessComponent::new(interpreter, script)))
        }
    }
}

/// Point the component at `<app_dir>/../plugins` and initialize it.
pub fn start_component(
    component: &mut dyn DetectionComponent,
    app_dir: &Path,
) -> Result<(), ComponentLoadError> {
    let run_dir = app_dir.join("..").join("plugins");
    component.set_run_directory(&run_dir);
    if !component.init() {
        error!(run_dir = %run_dir.display(), "detection component initialization failed");
        return Err(ComponentLoadError::InitFailed);
    }
    info!(detection_type = %component.detection_type(), "detection component initialized");
    Ok(())
}
