//! The high-level deployment document
//!
//! A document has a `user` block describing how to reach the hosts and one
//! entry per component:
//!
//! ```yaml
//! user:
//!   username: admin
//!   key_file: /home/admin/.ssh/id_rsa
//! oceanbase-ce:
//!   version: 4.2.1
//!   servers:
//!     - 10.0.0.1
//!     - name: server2
//!       ip: 10.0.0.2
//!   global:
//!     home_path: /home/admin/oceanbase
//!     memory_limit: 8G
//!   10.0.0.1:
//!     zone: zone1
//!   server2:
//!     zone: zone2
//! obproxy-ce:
//!   depends: [oceanbase-ce]
//!   servers: [10.0.0.3]
//!   global:
//!     listen_port: 2883
//! ```
//!
//! Every key under a component that is not `version`, `depends`, `servers` or
//! `global` is a per-server override block keyed by server name.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::{ConfigError, Result};

/// A single configuration value
pub type ConfigValue = serde_yaml::Value;

/// Ordered key to value configuration map
pub type ConfigMap = IndexMap<String, ConfigValue>;

/// A target host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ServerEntry", into = "ServerEntry")]
pub struct Server {
    /// Name used to key per-server overrides (defaults to the IP)
    pub name: String,
    /// Address used to connect
    pub ip: String,
}

impl Server {
    /// A server whose name is its IP
    pub fn new(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            name: ip.clone(),
            ip,
        }
    }

    /// A server with a distinct name
    pub fn named(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.ip {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}({})", self.name, self.ip)
        }
    }
}

/// Wire form of a server: a bare IP or a `{name, ip}` mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ServerEntry {
    Ip(String),
    Named {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        ip: String,
    },
}

impl From<ServerEntry> for Server {
    fn from(entry: ServerEntry) -> Self {
        match entry {
            ServerEntry::Ip(ip) => Server::new(ip),
            ServerEntry::Named { name: Some(name), ip } => Server::named(name, ip),
            ServerEntry::Named { name: None, ip } => Server::new(ip),
        }
    }
}

impl From<Server> for ServerEntry {
    fn from(server: Server) -> Self {
        if server.name == server.ip {
            ServerEntry::Ip(server.ip)
        } else {
            ServerEntry::Named {
                name: Some(server.name),
                ip: server.ip,
            }
        }
    }
}

fn default_username() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> u64 {
    30
}

/// How to reach the hosts of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// SSH user
    #[serde(default = "default_username")]
    pub username: String,

    /// Password; key authentication is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Connection timeout in seconds
    #[serde(default = "default_ssh_timeout")]
    pub timeout: u64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: None,
            key_file: None,
            port: default_ssh_port(),
            timeout: default_ssh_timeout(),
        }
    }
}

/// One component (product) of a deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Package version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Components this one requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,

    /// Target servers, in deployment order
    #[serde(default)]
    pub servers: Vec<Server>,

    /// Settings shared by all servers
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub global: ConfigMap,

    /// Per-server overrides keyed by server name
    #[serde(flatten)]
    pub server_overrides: IndexMap<String, ConfigMap>,
}

impl ComponentSpec {
    /// Create a component spec with the given servers and nothing else
    pub fn with_servers(servers: Vec<Server>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    /// Look up a server by name
    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// The override block for a server, if any
    pub fn overrides(&self, server: &str) -> Option<&ConfigMap> {
        self.server_overrides.get(server)
    }

    /// Resolved value of `key` for `server`: the override wins over global
    pub fn get(&self, server: &str, key: &str) -> Option<&ConfigValue> {
        self.server_overrides
            .get(server)
            .and_then(|o| o.get(key))
            .or_else(|| self.global.get(key))
    }

    /// Global settings with the server's overrides applied on top
    pub fn effective(&self, server: &str) -> ConfigMap {
        let mut merged = self.global.clone();
        if let Some(overrides) = self.server_overrides.get(server) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Set a global value, returning the previous one
    pub fn set_global(&mut self, key: impl Into<String>, value: ConfigValue) -> Option<ConfigValue> {
        self.global.insert(key.into(), value)
    }

    /// Set a per-server override, returning the previous one
    pub fn set_server(
        &mut self,
        server: &str,
        key: impl Into<String>,
        value: ConfigValue,
    ) -> Option<ConfigValue> {
        self.server_overrides
            .entry(server.to_string())
            .or_default()
            .insert(key.into(), value)
    }

    /// Remove a global value
    pub fn remove_global(&mut self, key: &str) -> Option<ConfigValue> {
        self.global.shift_remove(key)
    }

    /// Remove a per-server override, dropping the block once empty
    pub fn remove_server(&mut self, server: &str, key: &str) -> Option<ConfigValue> {
        let overrides = self.server_overrides.get_mut(server)?;
        let old = overrides.shift_remove(key);
        if overrides.is_empty() {
            self.server_overrides.shift_remove(server);
        }
        old
    }

    /// Check internal consistency
    pub fn validate(&self, component: &str) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Component '{}' has no servers",
                component
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.ip.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Component '{}' has a server with an empty address",
                    component
                )));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Component '{}' lists server '{}' more than once",
                    component, server.name
                )));
            }
        }

        for name in self.server_overrides.keys() {
            if self.server(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Component '{}' has overrides for unknown server '{}'",
                    component, name
                )));
            }
        }

        Ok(())
    }
}

/// The whole deployment document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Connection settings
    #[serde(default)]
    pub user: UserConfig,

    /// Components keyed by name, in declaration order
    #[serde(flatten)]
    pub components: IndexMap<String, ComponentSpec>,
}

impl DeploymentSpec {
    /// Look up a component
    pub fn component(&self, name: &str) -> Result<&ComponentSpec> {
        self.components
            .get(name)
            .ok_or_else(|| ConfigError::ComponentNotFound(name.to_string()))
    }

    /// Look up a component mutably
    pub fn component_mut(&mut self, name: &str) -> Result<&mut ComponentSpec> {
        self.components
            .get_mut(name)
            .ok_or_else(|| ConfigError::ComponentNotFound(name.to_string()))
    }

    /// Every distinct server across all components, first occurrence first
    pub fn distinct_servers(&self) -> Vec<Server> {
        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        for component in self.components.values() {
            for server in &component.servers {
                if seen.insert(server.ip.clone()) {
                    servers.push(server.clone());
                }
            }
        }
        servers
    }

    /// Components that declare `name` as a dependency
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, c)| c.depends.iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Component names ordered so that dependencies come first
    ///
    /// Dependencies on components that are not declared are ignored here;
    /// plugins may add them during generation.
    pub fn dependency_order(&self) -> Result<Vec<String>> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        for name in self.components.keys() {
            self.visit(name, &mut visited, &mut visiting, &mut result)?;
        }

        Ok(result)
    }

    fn visit(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(ConfigError::DependencyCycle(name.to_string()));
        }

        if let Some(component) = self.components.get(name) {
            for dep in &component.depends {
                if self.components.contains_key(dep) {
                    self.visit(dep, visited, visiting, result)?;
                }
            }
        }

        visiting.remove(name);
        visited.insert(name.to_string());
        result.push(name.to_string());
        Ok(())
    }

    /// Check the whole document
    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(ConfigError::ValidationError(
                "Deployment declares no components".to_string(),
            ));
        }
        for (name, component) in &self.components {
            component.validate(name)?;
        }
        self.dependency_order()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> ConfigValue {
        ConfigValue::String(s.to_string())
    }

    #[test]
    fn test_server_display() {
        assert_eq!(Server::new("10.0.0.1").to_string(), "10.0.0.1");
        assert_eq!(Server::named("s1", "10.0.0.1").to_string(), "s1(10.0.0.1)");
    }

    #[test]
    fn test_override_wins_over_global() {
        let mut spec = ComponentSpec::with_servers(vec![Server::new("a"), Server::new("b")]);
        spec.set_global("memory_limit", value("4G"));
        spec.set_server("b", "memory_limit", value("8G"));

        assert_eq!(spec.get("a", "memory_limit"), Some(&value("4G")));
        assert_eq!(spec.get("b", "memory_limit"), Some(&value("8G")));
        assert_eq!(spec.effective("b").get("memory_limit"), Some(&value("8G")));
    }

    #[test]
    fn test_remove_server_drops_empty_block() {
        let mut spec = ComponentSpec::with_servers(vec![Server::new("a")]);
        spec.set_server("a", "zone", value("z1"));
        assert_eq!(spec.remove_server("a", "zone"), Some(value("z1")));
        assert!(spec.server_overrides.is_empty());
        assert_eq!(spec.remove_server("a", "zone"), None);
    }

    #[test]
    fn test_dependency_order_and_cycle() {
        let mut spec = DeploymentSpec::default();
        let mut proxy = ComponentSpec::with_servers(vec![Server::new("10.0.0.3")]);
        proxy.depends = vec!["db".to_string()];
        spec.components.insert("proxy".to_string(), proxy);
        spec.components
            .insert("db".to_string(), ComponentSpec::with_servers(vec![Server::new("10.0.0.1")]));

        assert_eq!(spec.dependency_order().unwrap(), vec!["db", "proxy"]);

        spec.component_mut("db").unwrap().depends = vec!["proxy".to_string()];
        assert!(matches!(
            spec.dependency_order(),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_override() {
        let mut component = ComponentSpec::with_servers(vec![Server::new("10.0.0.1")]);
        component.set_server("10.0.0.9", "zone", value("z9"));
        assert!(component.validate("db").is_err());
    }

    #[test]
    fn test_distinct_servers() {
        let mut spec = DeploymentSpec::default();
        spec.components.insert(
            "db".to_string(),
            ComponentSpec::with_servers(vec![Server::new("10.0.0.1"), Server::new("10.0.0.2")]),
        );
        spec.components.insert(
            "agent".to_string(),
            ComponentSpec::with_servers(vec![Server::new("10.0.0.2"), Server::new("10.0.0.3")]),
        );
        let ips: Vec<_> = spec.distinct_servers().into_iter().map(|s| s.ip).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}
