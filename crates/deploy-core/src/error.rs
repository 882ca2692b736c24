//! Error types for deploy-core

use thiserror::Error;

use crate::task::TaskKind;

/// Result type alias for deploy-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Control plane error types
#[derive(Error, Debug)]
pub enum Error {
    /// A server could not be reached
    #[error("Cannot reach {server}: {reason}")]
    Connectivity {
        /// Server address
        server: String,
        /// Underlying failure
        reason: String,
    },

    /// The deployment or generated configuration is not acceptable
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Starting, stopping or checking a daemon failed
    #[error("Process lifecycle error: {0}")]
    ProcessLifecycle(#[from] process_coordinator::Error),

    /// An operation failed on several servers
    #[error("{operation} failed on {} server(s): {}", .failures.len(), .failures.join("; "))]
    Aggregate {
        /// Operation name
        operation: String,
        /// One message per failed server
        failures: Vec<String>,
    },

    /// A task of the same kind is still active for the subject
    #[error("Task conflict: {0}")]
    TaskConflict(String),

    /// Auto-recovery could not run
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Stored configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] deploy_config::ConfigError),

    /// No such task
    #[error("No {kind} task for '{subject}'")]
    TaskNotFound {
        /// Deployment name
        subject: String,
        /// Task kind
        kind: TaskKind,
    },

    /// No handler for a step
    #[error("No handler for step '{step}' of component '{component}'")]
    StepNotFound {
        /// Component name
        component: String,
        /// Step name
        step: String,
    },

    /// The deployment is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A remote command failed for a reason other than connectivity
    #[error("Command error: {0}")]
    Command(command_executor::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<command_executor::Error> for Error {
    fn from(err: command_executor::Error) -> Self {
        match err {
            command_executor::Error::SshConnectionFailed { host, reason } => Error::Connectivity {
                server: host,
                reason,
            },
            other => Error::Command(other),
        }
    }
}

impl Error {
    /// Create a connectivity error
    pub fn connectivity(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation(message.into())
    }

    /// Create a task conflict error
    pub fn task_conflict(subject: &str, kind: TaskKind, what: &str) -> Self {
        Self::TaskConflict(format!("{kind} task for '{subject}' {what}"))
    }

    /// Create a recovery error
    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery(message.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Collapse per-server lifecycle failures into one error
    pub fn from_failures(operation: &str, mut failures: Vec<process_coordinator::ServerFailure>) -> Self {
        if failures.len() == 1 {
            if let Some(failure) = failures.pop() {
                return Error::ProcessLifecycle(failure.error);
            }
        }
        Error::Aggregate {
            operation: operation.to_string(),
            failures: failures
                .iter()
                .map(|f| format!("{}: {}", f.server, f.error))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_failure_becomes_connectivity() {
        let err: Error = command_executor::Error::ssh_connection_failed("10.0.0.1", "timeout").into();
        assert!(matches!(err, Error::Connectivity { ref server, .. } if server == "10.0.0.1"));
    }

    #[test]
    fn test_task_conflict_message() {
        let err = Error::task_conflict("prod", TaskKind::Install, "is still running");
        assert_eq!(err.to_string(), "Task conflict: install task for 'prod' is still running");
    }
}
