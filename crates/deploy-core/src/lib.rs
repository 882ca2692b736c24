//! Deployment control plane
//!
//! Ties together the pieces that drive a deployment across its servers:
//! background tasks guarded per deployment and operation kind, the precheck
//! and recovery cycle, named deployment steps, and the [`ControlPlane`]
//! operations built on top of them.

#![warn(missing_docs)]

pub mod check;
pub mod connector;
pub mod control;
pub mod error;
pub mod locks;
pub mod namespace;
pub mod plugin;
pub mod precheck;
pub mod recover;
pub mod steps;
pub mod task;

pub use error::{Error, Result};

/// Convenience prelude for deploy-core users
pub mod prelude {
    pub use crate::check::{CheckItem, CheckStatus, FixEval, PrecheckResultView, Suggestion};
    pub use crate::connector::{Connector, SshConnector};
    pub use crate::control::{ControlPlane, ControlPlaneConfig, DeploymentSummary};
    pub use crate::error::{Error, Result};
    pub use crate::plugin::{ComponentPlugin, ComponentProfile, GenericComponent, PluginRegistry};
    pub use crate::recover::RecoveryReport;
    pub use crate::steps::{FnStep, StepContext, StepHandler, StepRegistry};
    pub use crate::task::{TaskHandle, TaskKind, TaskStatusView};

    pub use async_trait::async_trait;
    pub use serde_json::{Value, json};
}

// Re-export key types from sibling crates
pub use deploy_config::{ComponentSpec, Deployment, DeploymentSpec, DeploymentStatus, DeploymentStore};
pub use process_coordinator::{Coordinator, CoordinatorPolicy};
