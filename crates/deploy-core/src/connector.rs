//! Opening shells on deployment servers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use command_executor::{Command, Executor, LocalLauncher, Shell, SshConfig};
use deploy_config::{Server, UserConfig};
use tracing::debug;

use crate::{Error, Result};

/// Produces a connected [`Shell`] for a server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `server` with the deployment's credentials
    ///
    /// A returned shell has already run a command successfully.
    async fn connect(&self, server: &Server, user: &UserConfig) -> Result<Arc<dyn Shell>>;
}

/// Connects through the system `ssh` client
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    extra_args: Vec<String>,
}

impl SshConnector {
    /// A connector with default client options
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass an extra option to every `ssh` invocation
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    fn config(&self, server: &Server, user: &UserConfig) -> SshConfig {
        let mut config = SshConfig::new(&server.ip)
            .with_user(&user.username)
            .with_port(user.port)
            .with_connect_timeout(Duration::from_secs(user.timeout));
        if let Some(key_file) = &user.key_file {
            config = config.with_identity_file(key_file);
        }
        if let Some(password) = &user.password {
            config = config.with_password(password);
        }
        for arg in &self.extra_args {
            config = config.with_extra_arg(arg);
        }
        config
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, server: &Server, user: &UserConfig) -> Result<Arc<dyn Shell>> {
        let shell = Executor::ssh(LocalLauncher, self.config(server, user));

        debug!(server = %server.name, ip = %server.ip, user = %user.username, "probing ssh connection");
        shell
            .run_checked(Command::shell("true"))
            .await
            .map_err(|e| Error::connectivity(&server.ip, e.to_string()))?;

        Ok(Arc::new(shell))
    }
}
