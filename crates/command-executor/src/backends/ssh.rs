//! SSH remote execution backend using the system `ssh` client

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::process::ExitResult;

/// Exit code the OpenSSH client uses for its own failures
const SSH_CLIENT_FAILURE: i32 = 255;

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// Password, passed to `sshpass` through its environment
    password: Option<String>,
    /// Connection timeout
    connect_timeout: Option<Duration>,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            password: None,
            connect_timeout: None,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Authenticate with a password instead of a key
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Fail the connection attempt after `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// The configured host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the host string (user@host if user is specified)
    fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// Build the local command that runs `remote` on this host
    fn wrap(&self, remote: &Command) -> Command {
        let mut ssh_cmd = match &self.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd
            }
        };

        ssh_cmd.arg("-o").arg("StrictHostKeyChecking=no");

        if let Some(timeout) = self.connect_timeout {
            ssh_cmd
                .arg("-o")
                .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }

        if let Some(port) = self.port {
            ssh_cmd.arg("-p").arg(port.to_string());
        }

        if let Some(identity) = &self.identity_file {
            ssh_cmd.arg("-i").arg(identity.to_string_lossy().to_string());
        }

        for arg in &self.extra_args {
            ssh_cmd.arg(arg);
        }

        ssh_cmd.arg(self.host_string());
        ssh_cmd.arg(remote.to_shell_string());
        ssh_cmd
    }
}

/// SSH launcher that wraps another launcher for remote execution
#[derive(Debug, Clone)]
pub struct SshLauncher<L> {
    inner: L,
    config: SshConfig,
}

impl<L> SshLauncher<L> {
    /// Create a new SSH launcher wrapping the given inner launcher
    pub fn new(inner: L, config: SshConfig) -> Self {
        Self { inner, config }
    }

    /// The connection configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

impl SshLauncher<crate::backends::local::LocalLauncher> {
    /// Convenience constructor for SSH wrapping LocalLauncher
    pub fn to_host(config: SshConfig) -> Self {
        Self {
            inner: crate::backends::local::LocalLauncher,
            config,
        }
    }
}

#[async_trait]
impl<L> Launcher for SshLauncher<L>
where
    L: Launcher,
{
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        let ssh_cmd = self.config.wrap(&command);
        debug!(host = %self.config.host, command = %command, "executing remote command");

        let result = self.inner.execute(ssh_cmd).await?;

        // ssh reserves 255 for its own failures (unreachable, auth refused)
        if result.status.code == Some(SSH_CLIENT_FAILURE) {
            return Err(Error::ssh_connection_failed(
                &self.config.host,
                result.stderr.trim().to_string(),
            ));
        }

        Ok(result)
    }
}

// Convenience constructor for Executor with SshLauncher
impl<L> crate::executor::Executor<SshLauncher<L>>
where
    L: Launcher,
{
    /// Create an executor for SSH remote execution
    pub fn ssh(inner: L, config: SshConfig) -> Self {
        let name = config.host.clone();
        Self::new(name, SshLauncher::new(inner, config))
    }
}
