//! # Deployment Configuration
//!
//! Deployment documents and their persisted state for the cluster control
//! plane.
//!
//! - [`spec`]: the high-level, user-authored deployment document (YAML).
//! - [`deployment`]: a stored deployment with lifecycle status and the
//!   low-level, per-component generated configuration.
//! - [`schema`]: typed parameter definitions used to validate and default
//!   component settings.
//! - [`reconcile`]: collapses near-uniform per-server values into a single
//!   global definition.
//! - [`store`]: file-backed persistence.

#![warn(missing_docs)]

use thiserror::Error;

pub mod deployment;
pub mod parser;
pub mod reconcile;
pub mod schema;
pub mod spec;
pub mod store;

pub use deployment::{ComponentConfig, Deployment, DeploymentStatus};
pub use reconcile::{GeneratedConfig, reconcile, reconcile_and_commit};
pub use schema::{ParamDef, ParamIssue, ParamKind, ParamSchema};
pub use spec::{ComponentSpec, ConfigMap, ConfigValue, DeploymentSpec, Server, UserConfig};
pub use store::DeploymentStore;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write a configuration file
    #[error("Failed to access config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Component reference not found
    #[error("Component '{0}' not found")]
    ComponentNotFound(String),

    /// Deployment not found in the store
    #[error("Deployment '{0}' not found")]
    DeploymentNotFound(String),

    /// Deployment already exists in the store
    #[error("Deployment '{0}' already exists")]
    DeploymentExists(String),

    /// Lifecycle status change that is not allowed
    #[error("Deployment '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Deployment name
        name: String,
        /// Current status
        from: DeploymentStatus,
        /// Requested status
        to: DeploymentStatus,
    },

    /// Components depend on each other in a cycle
    #[error("Dependency cycle detected involving component '{0}'")]
    DependencyCycle(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
