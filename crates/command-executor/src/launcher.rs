//! Launcher trait for executing commands in different contexts

use crate::command::Command;
use crate::error::Result;
use crate::process::ExitResult;
use async_trait::async_trait;

/// A launcher that can execute commands in a specific context
///
/// Launchers are layered: a wrapping launcher (SSH) transforms the command and
/// delegates to the launcher it wraps.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Execute a command and wait for it to complete, capturing output
    ///
    /// A non-zero exit is not an error at this level; it is reported through
    /// [`ExitResult::status`].
    async fn execute(&self, command: Command) -> Result<ExitResult>;
}
