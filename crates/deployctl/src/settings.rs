//! `deployctl.yaml` settings

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deploy_core::control::ControlPlaneConfig;
use deploy_core::plugin::ComponentProfile;
use indexmap::IndexMap;
use process_coordinator::CoordinatorPolicy;
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "deployctl.yaml";

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    10
}

/// Where deployments live when nothing else is configured
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deployctl")
}

/// Where the settings file is looked up by default
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deployctl")
        .join(SETTINGS_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Default tracing filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write logs to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Deployment store location
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// Servers contacted at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Process start and stop bounds
    #[serde(default)]
    pub coordinator: CoordinatorPolicy,
    /// Component profiles by component name
    #[serde(default)]
    pub components: IndexMap<String, ComponentProfile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            home: default_home(),
            concurrency: default_concurrency(),
            coordinator: CoordinatorPolicy::default(),
            components: IndexMap::new(),
        }
    }
}

impl Settings {
    /// Read settings from `path`
    ///
    /// An explicitly given file must exist; the default location may be
    /// missing, in which case defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_settings_path(), false),
        };

        if !path.is_file() {
            if required {
                anyhow::bail!("Settings file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn control_plane(&self) -> ControlPlaneConfig {
        ControlPlaneConfig::new(&self.home)
            .with_concurrency(self.concurrency)
            .with_coordinator(self.coordinator.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.concurrency, 10);
        assert!(settings.home.ends_with(".deployctl"));
    }

    #[test]
    fn test_parse_profiles_and_policy() {
        let settings = Settings::parse(
            r#"
log_level: debug
home: /var/lib/deployctl
concurrency: 4
coordinator:
  deadline_secs: 300
components:
  observer:
    command: bin/observer -p ${port}
    port_keys: [port, rpc_port]
    requires: [config-server]
    min_free_disk: 20G
"#,
        )
        .unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.home, PathBuf::from("/var/lib/deployctl"));
        assert_eq!(settings.coordinator.deadline_secs, Some(300));

        let observer = &settings.components["observer"];
        assert_eq!(observer.home_key, "home_path");
        assert_eq!(observer.port_keys, vec!["port", "rpc_port"]);
        assert_eq!(observer.requires, vec!["config-server"]);

        let config = settings.control_plane();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.home, PathBuf::from("/var/lib/deployctl"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Settings::parse("log_levl: debug\n").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join(SETTINGS_FILE))).unwrap_err();
        assert!(err.to_string().contains("Settings file not found"));
    }
}
