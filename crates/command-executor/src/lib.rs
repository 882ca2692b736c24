//! Runtime-agnostic command execution library
//!
//! This crate runs commands either on the local machine or on a remote host
//! through the system `ssh` client, capturing exit status and output.
//!
//! Launchers compose: [`SshLauncher`](backends::SshLauncher) rewrites a
//! command into an `ssh` invocation and hands it to an inner launcher
//! (normally [`LocalLauncher`](backends::LocalLauncher)). Callers that only
//! need "run this on that host" use the object-safe [`Shell`] trait, which
//! [`Executor`] implements for every launcher.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod process;

pub use backends::{LocalLauncher, SshConfig, SshLauncher};
pub use command::{Command, shell_escape};
pub use error::{Error, Result};
pub use executor::{Executor, Shell};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus};
