//! Local process execution backend

use async_process::Stdio;
use async_trait::async_trait;
use tracing::trace;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::process::ExitResult;

/// Launcher for executing processes locally
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

#[async_trait]
impl Launcher for LocalLauncher {
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        let mut async_cmd = command.prepare();
        async_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        trace!(command = %command, "executing local command");

        let output = async_cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.get_program().to_string_lossy().into_owned(),
                }
            } else {
                Error::spawn_failed(format!("Failed to spawn process: {}", e))
            }
        })?;

        Ok(ExitResult {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// Convenience constructor for Executor with LocalLauncher
impl crate::executor::Executor<LocalLauncher> {
    /// Create an executor for local process execution
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name.into(), LocalLauncher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_captures_stdout_and_status() {
        let result = LocalLauncher
            .execute(Command::shell("echo hello; echo oops >&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(result.stdout_trimmed(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.status.code, Some(3));
        assert!(!result.success());
    }

    #[smol_potat::test]
    async fn test_missing_program() {
        let err = LocalLauncher
            .execute(Command::new("definitely-not-a-real-binary-name"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[smol_potat::test]
    async fn test_working_directory() {
        let mut cmd = Command::new("pwd");
        cmd.current_dir("/");
        let result = LocalLauncher.execute(cmd).await.unwrap();
        assert_eq!(result.stdout_trimmed(), "/");
    }
}
