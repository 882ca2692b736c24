//! Named executors and the object-safe [`Shell`] interface

use async_trait::async_trait;
use tracing::warn;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::process::ExitResult;

/// Something that can run commands on one host
///
/// This is the handle the rest of the control plane holds for a server. It is
/// object safe so per-server handles can be stored as `Arc<dyn Shell>` and
/// replaced by scripted fakes in tests.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Host label used in logs and error messages
    fn host(&self) -> &str;

    /// Run a command to completion
    async fn run(&self, command: Command) -> Result<ExitResult>;

    /// Run a command and return its stdout, failing on a non-zero exit
    async fn run_checked(&self, command: Command) -> Result<String> {
        let rendered = command.to_string();
        let result = self.run(command).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(Error::CommandFailed {
                host: self.host().to_string(),
                command: rendered,
                code: result.status.code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }

    /// Run a shell script and report only whether it exited with 0
    async fn test(&self, script: &str) -> Result<bool> {
        Ok(self.run(Command::shell(script)).await?.success())
    }
}

/// An executor that runs commands via a specific launcher
pub struct Executor<L: Launcher> {
    /// The name for logging/identification (the host for SSH executors)
    name: String,
    /// The launcher implementation
    launcher: L,
}

impl<L: Launcher> Executor<L> {
    /// Create a new executor with the given launcher
    pub fn new(name: String, launcher: L) -> Self {
        Self { name, launcher }
    }

    /// Get the executor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the launcher
    pub fn launcher(&self) -> &L {
        &self.launcher
    }
}

#[async_trait]
impl<L: Launcher> Shell for Executor<L> {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: Command) -> Result<ExitResult> {
        let result = self.launcher.execute(command).await;
        if let Err(e) = &result {
            warn!(host = %self.name, error = %e, "command execution failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_run_checked_success() {
        let executor = Executor::local("localhost");
        let out = executor.run_checked(Command::shell("printf 42")).await.unwrap();
        assert_eq!(out, "42");
        assert_eq!(executor.host(), "localhost");
    }

    #[smol_potat::test]
    async fn test_run_checked_failure_carries_stderr() {
        let executor = Executor::local("localhost");
        let err = executor
            .run_checked(Command::shell("echo broken >&2; exit 2"))
            .await
            .unwrap_err();

        match err {
            Error::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[smol_potat::test]
    async fn test_test_helper() {
        let executor = Executor::local("localhost");
        assert!(executor.test("[ -d / ]").await.unwrap());
        assert!(!executor.test("[ -d /definitely/missing ]").await.unwrap());
    }
}
