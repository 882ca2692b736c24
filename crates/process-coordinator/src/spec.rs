//! What to run and where

use std::fmt;
use std::sync::Arc;

use command_executor::Shell;

/// How one component's daemon is run on one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Component name, used in PID file names and logs
    pub component: String,
    /// Installation directory on the server
    pub home_path: String,
    /// Exact invocation; also the string matched in the process table
    pub command: String,
    /// Ports the daemon must listen on
    pub ports: Vec<u16>,
    /// Also kill the process group on stop
    pub kill_group: bool,
}

impl ProcessSpec {
    /// Create a spec with no ports
    pub fn new(
        component: impl Into<String>,
        home_path: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            home_path: home_path.into(),
            command: command.into(),
            ports: Vec::new(),
            kill_group: false,
        }
    }

    /// Set the declared ports
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    /// Kill the whole process group on stop
    pub fn with_kill_group(mut self, kill_group: bool) -> Self {
        self.kill_group = kill_group;
        self
    }

    /// `<home>/run/<component>-<ip>-<port>.pid`, using the first declared port
    pub fn pid_file(&self, ip: &str) -> String {
        let port = self.ports.first().copied().unwrap_or(0);
        format!(
            "{}/run/{}-{}-{}.pid",
            self.home_path.trim_end_matches('/'),
            self.component,
            ip,
            port
        )
    }

    /// `<home>/log/<component>.log`
    pub fn log_file(&self) -> String {
        format!(
            "{}/log/{}.log",
            self.home_path.trim_end_matches('/'),
            self.component
        )
    }
}

/// A server and the shell that reaches it
#[derive(Clone)]
pub struct ServerTarget {
    /// Server name
    pub name: String,
    /// Server address
    pub ip: String,
    /// Command channel to the server
    pub shell: Arc<dyn Shell>,
}

impl ServerTarget {
    /// Create a target
    pub fn new(name: impl Into<String>, ip: impl Into<String>, shell: Arc<dyn Shell>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            shell,
        }
    }
}

impl fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTarget")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("shell", &self.shell.host())
            .finish()
    }
}

/// One unit of fan-out work: a spec bound to a server
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    /// Where to run
    pub server: ServerTarget,
    /// What to run there
    pub spec: ProcessSpec,
}

impl ProcessTarget {
    /// Bind a spec to a server
    pub fn new(server: ServerTarget, spec: ProcessSpec) -> Self {
        Self { server, spec }
    }

    /// PID file path for this server
    pub fn pid_file(&self) -> String {
        self.spec.pid_file(&self.server.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_uses_first_port() {
        let spec = ProcessSpec::new("observer", "/home/admin/ob/", "bin/observer").with_ports([2881, 2882]);
        assert_eq!(spec.pid_file("10.0.0.1"), "/home/admin/ob/run/observer-10.0.0.1-2881.pid");
        assert_eq!(spec.log_file(), "/home/admin/ob/log/observer.log");
    }

    #[test]
    fn test_pid_file_without_ports() {
        let spec = ProcessSpec::new("agent", "/opt/agent", "bin/agent");
        assert_eq!(spec.pid_file("10.0.0.2"), "/opt/agent/run/agent-10.0.0.2-0.pid");
    }
}
