//! `${VAR}` / `${VAR:-default}` expansion.

use std::sync::LazyLock;

use regex::Regex;

use super::{ConfigError, EnvLookup};

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::-(.*?))?\}").expect("valid variable pattern"));

/// Expand every `${VAR}` and `${VAR:-default}` in `input`.
///
/// Fails listing every referenced variable that is unset and has no default.
pub fn interpolate_env_vars(input: &str, lookup: EnvLookup<'_>) -> Result<String, ConfigError> {
    let mut missing = Vec::new();
    let expanded = VARIABLE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match lookup(name) {
            Some(value) => value,
            None => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            },
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingVariables(missing));
    }
    Ok(expanded.into_owned())
}

/// Expand variables in a config file, leaving `#` comment lines untouched.
pub fn interpolate_file_content(content: &str, lookup: EnvLookup<'_>) -> Result<String, ConfigError> {
    let lines = content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with('#') {
                Ok(line.to_string())
            } else {
                interpolate_env_vars(line, lookup)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}
