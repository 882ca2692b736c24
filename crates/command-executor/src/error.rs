//! Error types for command execution

use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Command not found
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// SSH could not reach or authenticate against the host
    #[error("SSH connection failed to {host}: {reason}")]
    SshConnectionFailed {
        /// The hostname or IP address that failed to connect
        host: String,
        /// The detailed reason for the connection failure
        reason: String,
    },

    /// The command ran but exited unsuccessfully
    #[error("command `{command}` failed on {host} with exit code {code:?}: {stderr}")]
    CommandFailed {
        /// Host the command ran on
        host: String,
        /// Rendered command line
        command: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create an SSH connection error
    pub fn ssh_connection_failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SshConnectionFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the host itself could not be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::SshConnectionFailed { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
