//! # Process Coordinator
//!
//! Starts, stops and health-checks component daemons on remote servers.
//!
//! Every server runs its own small state machine and the coordinator fans the
//! servers out with a bounded concurrency, collecting every failure into a
//! [`CoordinatorReport`] instead of stopping at the first one.
//!
//! - **start**: reuse a live PID from the PID file, otherwise launch the
//!   daemon under `nohup`, discover its PID from the process table and write
//!   the PID file.
//! - **health check**: confirm the PID is alive and owns a listening socket
//!   on every declared port, by cross-referencing `/proc/net/tcp*` with the
//!   PID's fd table.
//! - **stop**: `kill -9` the PID (and optionally its process group), then wait
//!   until none of the declared ports is attributed to it any more.
//!
//! All confirmation loops are bounded by a [`PollPolicy`].

#![warn(missing_docs)]

mod coordinator;
mod policy;
pub mod procfs;
mod report;
mod spec;
#[cfg(feature = "test-utils")]
pub mod testing;

pub use coordinator::{Coordinator, ProcessStatus, RemoteProcessHandle, StopOutcome};
pub use policy::{CoordinatorPolicy, PollPolicy};
pub use report::{CoordinatorReport, ServerFailure};
pub use spec::{ProcessSpec, ProcessTarget, ServerTarget};

/// Error types for process lifecycle operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A remote command could not be run
    #[error("Command execution error: {0}")]
    Command(#[from] command_executor::Error),

    /// The launch command itself failed
    #[error("failed to launch {component} on {server}: {reason}")]
    LaunchFailed {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// Why the launch failed
        reason: String,
    },

    /// The launched process never showed up in the process table
    #[error("{component} on {server} failed to start after {seconds} seconds")]
    StartTimeout {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// Time spent waiting
        seconds: u64,
    },

    /// The process exited while being health-checked
    #[error("{component} on {server}: process {pid} is not running")]
    ProcessDied {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// PID that disappeared
        pid: u32,
    },

    /// The process never bound every declared port
    #[error("{component} on {server}: ports {ports:?} not listening after {attempts} checks")]
    HealthCheckTimeout {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// Ports that were not bound
        ports: Vec<u16>,
        /// Number of checks made
        attempts: u32,
    },

    /// The killed process still owns its ports
    #[error("{component} on {server}: port not released by process {pid} ({ports:?})")]
    PortNotReleased {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// PID that was killed
        pid: u32,
        /// Ports still attributed to the PID
        ports: Vec<u16>,
    },

    /// The per-server operation panicked
    #[error("operation on {server} panicked")]
    Panicked {
        /// Server name
        server: String,
    },

    /// The outer deadline cut polling short
    #[error("{component} on {server}: {operation} timed out")]
    DeadlineExceeded {
        /// Component name
        component: String,
        /// Server name
        server: String,
        /// Lifecycle operation
        operation: &'static str,
    },
}

impl Error {
    /// Whether retrying the operation later can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PortNotReleased { .. } | Error::DeadlineExceeded { .. }
        )
    }

    /// Whether the failure is a lost connection to the server
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Command(e) if e.is_connectivity())
    }
}

/// Result type for process lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;
