//! Stored deployments and their lifecycle status

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::spec::{ConfigMap, ConfigValue, DeploymentSpec};
use crate::{ConfigError, Result};

/// Lifecycle status of a deployment
///
/// `Upgrading` is not a status: it is tracked as an overlay flag on
/// [`Deployment`] because an upgrade happens while the deployment stays
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Document submitted, not yet stored completely
    Configuring,
    /// Document stored
    Configured,
    /// Install in progress
    Deploying,
    /// Every component installed
    Deployed,
    /// Every component started
    Running,
    /// Stop in progress
    Stopping,
    /// Every component stopped
    Stopped,
    /// Destroy in progress
    Destroying,
    /// Torn down
    Destroyed,
}

impl DeploymentStatus {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (Configuring, Configured)
                | (Configured, Configuring)
                | (Configured, Deploying)
                | (Configured, Destroying)
                | (Deploying, Deployed)
                | (Deploying, Configured)
                | (Deploying, Destroying)
                | (Deployed, Running)
                | (Deployed, Stopping)
                | (Deployed, Destroying)
                | (Running, Running)
                | (Running, Stopping)
                | (Running, Destroying)
                | (Stopping, Stopped)
                | (Stopping, Running)
                | (Stopped, Running)
                | (Stopped, Stopping)
                | (Stopped, Destroying)
                | (Destroying, Destroyed)
                | (Destroying, Destroying)
                | (Destroyed, Configuring)
                | (Destroyed, Configured)
        )
    }

    /// Whether components are expected to have processes on their servers
    pub fn is_deployed(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deployed
                | DeploymentStatus::Running
                | DeploymentStatus::Stopping
                | DeploymentStatus::Stopped
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Configuring => "configuring",
            DeploymentStatus::Configured => "configured",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Destroying => "destroying",
            DeploymentStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Low-level configuration of one component after generation
///
/// This is what processes are actually started with. A key in
/// `servers[name]` always wins over the same key in `global`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Values shared by every server
    #[serde(default)]
    pub global: ConfigMap,
    /// Per-server overrides keyed by server name
    #[serde(default)]
    pub servers: IndexMap<String, ConfigMap>,
}

impl ComponentConfig {
    /// Resolved value of `key` for `server`
    pub fn get(&self, server: &str, key: &str) -> Option<&ConfigValue> {
        self.servers
            .get(server)
            .and_then(|o| o.get(key))
            .or_else(|| self.global.get(key))
    }

    /// Global settings with the server's overrides applied on top
    pub fn effective(&self, server: &str) -> ConfigMap {
        let mut merged = self.global.clone();
        if let Some(overrides) = self.servers.get(server) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// A deployment as persisted by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    /// Unique name
    pub name: String,
    /// Lifecycle status
    pub status: DeploymentStatus,
    /// Overlay flag set while an upgrade runs
    pub upgrading: bool,
    /// The user-authored document
    pub spec: DeploymentSpec,
    /// Generated per-component configuration
    pub generated: IndexMap<String, ComponentConfig>,
    /// When the deployment was first stored
    pub created_at: DateTime<Utc>,
    /// Last time the deployment was written
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// A new deployment in `Configuring` status
    pub fn new(name: impl Into<String>, spec: DeploymentSpec) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: DeploymentStatus::Configuring,
            upgrading: false,
            spec,
            generated: IndexMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new status, enforcing the lifecycle
    pub fn transition(&mut self, next: DeploymentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConfigError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(deployment = %self.name, from = %self.status, to = %next, "status transition");
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Generated configuration of a component, if it has been generated
    pub fn component_config(&self, component: &str) -> Option<&ComponentConfig> {
        self.generated.get(component)
    }

    /// Resolved value of `key` for a server: generated config first, then the
    /// document
    pub fn resolved(&self, component: &str, server: &str, key: &str) -> Option<ConfigValue> {
        if let Some(value) = self.generated.get(component).and_then(|c| c.get(server, key)) {
            return Some(value.clone());
        }
        self.spec
            .components
            .get(component)
            .and_then(|c| c.get(server, key))
            .cloned()
    }
}
