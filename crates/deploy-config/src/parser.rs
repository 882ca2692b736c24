//! Deployment document parsing
//!
//! Documents may reference environment variables as `${VAR}` or
//! `${VAR:-default}`; they are substituted before the YAML is parsed so
//! credentials do not have to live in the file.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::spec::DeploymentSpec;
use crate::{ConfigError, Result};

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex"))
}

/// Parse a deployment document from a file
pub fn parse_file(path: impl AsRef<Path>) -> Result<DeploymentSpec> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse a deployment document from a string
pub fn parse_str(content: &str) -> Result<DeploymentSpec> {
    let substituted = substitute_env_vars(content)?;
    let spec: DeploymentSpec = serde_yaml::from_str(&substituted)?;
    spec.validate()?;
    Ok(spec)
}

/// Render a deployment document back to YAML
pub fn to_yaml(spec: &DeploymentSpec) -> Result<String> {
    Ok(serde_yaml::to_string(spec)?)
}

/// Substitute `${VAR}` and `${VAR:-default}` references
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();

    let result = env_var_pattern().replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            },
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }

    Ok(result.into_owned())
}
