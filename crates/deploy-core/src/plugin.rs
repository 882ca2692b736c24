//! Component plugins
//!
//! A plugin turns a component's high-level spec into its full low-level
//! configuration, declares the checks it runs on servers and knows how to
//! build the [`ProcessSpec`] that starts it. [`GenericComponent`] covers
//! components described entirely by a [`ComponentProfile`]; dedicated plugins
//! can be registered by name in the [`PluginRegistry`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use command_executor::{Command, Shell};
use deploy_config::schema::{as_integer, format_capacity, parse_capacity};
use deploy_config::{
    ComponentSpec, ConfigMap, ConfigValue, GeneratedConfig, ParamIssue, ParamSchema, Server,
};
use futures::future::join_all;
use indexmap::IndexMap;
use process_coordinator::ProcessSpec;
use process_coordinator::procfs::parse_listening_sockets;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::check::{CheckItem, FixEval, Suggestion};
use crate::{Error, Result};

/// Runtime check names
pub const PORT_CHECK: &str = "port";
/// Free space under the home path
pub const DISK_CHECK: &str = "disk";
/// Available memory against the configured limit
pub const MEMORY_CHECK: &str = "memory";
/// Installed version of a required binary
pub const RUNTIME_DEPENDENCY_CHECK: &str = "runtime_dependency";

/// Prefix of per-parameter check items
pub const PARAM_PREFIX: &str = "param:";

const MB: u64 = 1 << 20;

/// Input to [`ComponentPlugin::generate`]
#[derive(Debug, Clone, Copy)]
pub struct GenerateInput<'a> {
    /// Deployment name
    pub deployment: &'a str,
    /// Component name
    pub component: &'a str,
    /// The component's high-level spec
    pub spec: &'a ComponentSpec,
}

/// Output of [`ComponentPlugin::generate`]
#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    /// Full per-server settings plus explicit globals, ready for reconciliation
    pub config: GeneratedConfig,
    /// Per-server `param:<key>` results
    pub param_checks: Vec<CheckItem>,
    /// Components this one cannot run without
    pub required_components: Vec<String>,
}

/// Input to [`ComponentPlugin::validate`]
#[derive(Clone)]
pub struct ValidateInput {
    /// Component name
    pub component: String,
    /// The component's high-level spec
    pub spec: ComponentSpec,
    /// Its reconciled low-level config
    pub config: GeneratedConfig,
    /// Connected servers hosting the component
    pub servers: Vec<(Server, Arc<dyn Shell>)>,
}

/// Component-specific behaviour
#[async_trait]
pub trait ComponentPlugin: Send + Sync {
    /// Plugin name
    fn name(&self) -> &str;

    /// Runtime check items run on every server
    fn check_items(&self) -> Vec<String>;

    /// Produce the full config from the high-level spec
    fn generate(&self, input: GenerateInput<'_>) -> Result<GenerateOutput>;

    /// Run the runtime checks on every server
    async fn validate(&self, input: ValidateInput) -> Result<Vec<CheckItem>>;

    /// How to run the component on one server, from its effective settings
    fn process_spec(&self, component: &str, server: &Server, config: &ConfigMap) -> Result<ProcessSpec>;
}

/// A binary that must be installed at a minimum version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDependency {
    /// Binary name or path
    pub binary: String,
    /// Minimum dotted version
    pub min_version: String,
}

fn default_home_key() -> String {
    "home_path".to_string()
}

fn default_port_keys() -> Vec<String> {
    vec!["port".to_string()]
}

/// Declarative description of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentProfile {
    /// Launch command; `${key}` is replaced by the server's setting. Falls
    /// back to the `command` setting when unset.
    #[serde(default)]
    pub command: Option<String>,
    /// Setting holding the install directory
    #[serde(default = "default_home_key")]
    pub home_key: String,
    /// Settings holding the ports the daemon listens on, first one first
    #[serde(default = "default_port_keys")]
    pub port_keys: Vec<String>,
    /// Kill the whole process group on stop
    #[serde(default)]
    pub kill_group: bool,
    /// Components added automatically when missing
    #[serde(default)]
    pub requires: Vec<String>,
    /// Capacity setting compared against available memory
    #[serde(default)]
    pub memory_key: Option<String>,
    /// Free space required under the home path, e.g. `10G`
    #[serde(default)]
    pub min_free_disk: Option<String>,
    /// Binary that must be installed
    #[serde(default)]
    pub runtime_dependency: Option<RuntimeDependency>,
    /// Known parameters
    #[serde(default)]
    pub params: ParamSchema,
}

impl Default for ComponentProfile {
    fn default() -> Self {
        Self {
            command: None,
            home_key: default_home_key(),
            port_keys: default_port_keys(),
            kill_group: false,
            requires: Vec::new(),
            memory_key: None,
            min_free_disk: None,
            runtime_dependency: None,
            params: ParamSchema::new(),
        }
    }
}

/// Plugin driven by a [`ComponentProfile`]
#[derive(Debug, Clone)]
pub struct GenericComponent {
    name: String,
    profile: ComponentProfile,
}

impl GenericComponent {
    /// Create a plugin
    pub fn new(name: impl Into<String>, profile: ComponentProfile) -> Self {
        Self {
            name: name.into(),
            profile,
        }
    }

    /// The profile
    pub fn profile(&self) -> &ComponentProfile {
        &self.profile
    }

    fn param_item(
        &self,
        component: &str,
        spec: &ComponentSpec,
        server: &str,
        key: &str,
        issue: Option<ParamIssue>,
    ) -> CheckItem {
        let name = format!("{PARAM_PREFIX}{key}");
        let Some(issue) = issue else {
            return CheckItem::pass(Some(component), server, &name);
        };

        let from_global = spec.global.contains_key(key)
            && spec.overrides(server).is_none_or(|o| !o.contains_key(key));
        let message = format!("{key}: {issue}");
        let item = CheckItem::fail(Some(component), server, &name, issue.code(), message);

        let default = self.profile.params.get(key).and_then(|d| d.default.clone());
        let suggestion = match (&issue, default) {
            (ParamIssue::OutOfRange { .. }, Some(default)) => Suggestion::with_fixes(
                format!("reset {key} to its default"),
                vec![FixEval::set(key, default, from_global)],
            ),
            (ParamIssue::Deprecated, _) => Suggestion::with_fixes(
                format!("remove {key}"),
                vec![FixEval::delete(key, from_global)],
            ),
            (ParamIssue::Missing, _) => Suggestion::manual(format!("set {key}")),
            _ => Suggestion::manual(format!("correct the value of {key}")),
        };
        item.with_suggestion(suggestion)
    }

    async fn check_server(
        &self,
        component: &str,
        server: &Server,
        shell: &dyn Shell,
        settings: &ConfigMap,
    ) -> Vec<CheckItem> {
        let mut items = Vec::new();
        for name in self.check_items() {
            let outcome = match name.as_str() {
                PORT_CHECK => self.check_ports(component, server, shell, settings).await,
                DISK_CHECK => self.check_disk(component, server, shell, settings).await,
                MEMORY_CHECK => self.check_memory(component, server, shell, settings).await,
                RUNTIME_DEPENDENCY_CHECK => self.check_runtime_dependency(component, server, shell).await,
                _ => Ok(CheckItem::pass(Some(component), &server.name, &name)),
            };
            items.push(outcome.unwrap_or_else(|e| {
                warn!(component, server = %server.name, check = %name, error = %e, "check could not run");
                CheckItem::fail(Some(component), &server.name, &name, "CHECK_ERROR", e.to_string())
            }));
        }
        items
    }

    fn ports(&self, settings: &ConfigMap) -> Vec<u16> {
        self.profile
            .port_keys
            .iter()
            .filter_map(|key| settings.get(key))
            .filter_map(as_integer)
            .filter_map(|p| u16::try_from(p).ok())
            .collect()
    }

    async fn check_ports(
        &self,
        component: &str,
        server: &Server,
        shell: &dyn Shell,
        settings: &ConfigMap,
    ) -> Result<CheckItem> {
        let ports = self.ports(settings);
        if ports.is_empty() {
            return Ok(CheckItem::pass(Some(component), &server.name, PORT_CHECK));
        }

        let table = shell
            .run(Command::shell("cat /proc/net/tcp /proc/net/tcp6 2>/dev/null"))
            .await?
            .stdout;
        let listening: Vec<u16> = parse_listening_sockets(&table).into_iter().map(|(p, _)| p).collect();
        let busy: Vec<u16> = ports.into_iter().filter(|p| listening.contains(p)).collect();

        if busy.is_empty() {
            return Ok(CheckItem::pass(Some(component), &server.name, PORT_CHECK));
        }
        Ok(CheckItem::fail(
            Some(component),
            &server.name,
            PORT_CHECK,
            "PORT_IN_USE",
            format!("{}: ports {:?} are already in use", server.ip, busy),
        )
        .with_suggestion(Suggestion::manual("stop the process using the port or choose another port")))
    }

    async fn check_disk(
        &self,
        component: &str,
        server: &Server,
        shell: &dyn Shell,
        settings: &ConfigMap,
    ) -> Result<CheckItem> {
        let required = self.profile.min_free_disk.as_deref().and_then(parse_capacity);
        let home = settings.get(&self.profile.home_key).and_then(|v| v.as_str());
        let (Some(required), Some(home)) = (required, home) else {
            return Ok(CheckItem::pass(Some(component), &server.name, DISK_CHECK));
        };

        // Walk up to the closest existing directory before asking df
        let script = format!(
            "p={}; while [ ! -d \"$p\" ]; do p=$(dirname \"$p\"); done; df -Pk \"$p\" | tail -n 1",
            command_executor::shell_escape(home)
        );
        let output = shell.run_checked(Command::shell(script)).await?;
        let available = output
            .split_whitespace()
            .nth(3)
            .and_then(|kb| kb.parse::<u64>().ok())
            .and_then(|kb| kb.checked_mul(1024))
            .ok_or_else(|| Error::validation(format!("unexpected df output on {}: {}", server.ip, output.trim())))?;

        if available >= required {
            return Ok(CheckItem::pass(Some(component), &server.name, DISK_CHECK));
        }
        Ok(CheckItem::fail(
            Some(component),
            &server.name,
            DISK_CHECK,
            "DISK_INSUFFICIENT",
            format!(
                "{}: {} free under {}, {} required",
                server.ip,
                format_capacity(available),
                home,
                format_capacity(required)
            ),
        )
        .with_suggestion(Suggestion::manual("free disk space or choose another home path")))
    }

    async fn check_memory(
        &self,
        component: &str,
        server: &Server,
        shell: &dyn Shell,
        settings: &ConfigMap,
    ) -> Result<CheckItem> {
        let Some(key) = &self.profile.memory_key else {
            return Ok(CheckItem::pass(Some(component), &server.name, MEMORY_CHECK));
        };
        let required = settings.get(key).and_then(|v| match v {
            ConfigValue::String(s) => parse_capacity(s),
            other => other.as_u64(),
        });
        let Some(required) = required else {
            return Ok(CheckItem::pass(Some(component), &server.name, MEMORY_CHECK));
        };

        let output = shell
            .run_checked(Command::shell("grep MemAvailable /proc/meminfo"))
            .await?;
        let available = parse_meminfo(&output)
            .ok_or_else(|| Error::validation(format!("unexpected meminfo on {}: {}", server.ip, output.trim())))?;

        if available >= required {
            return Ok(CheckItem::pass(Some(component), &server.name, MEMORY_CHECK));
        }

        let fitted = (available / MB) * MB;
        Ok(CheckItem::fail(
            Some(component),
            &server.name,
            MEMORY_CHECK,
            "MEMORY_INSUFFICIENT",
            format!(
                "{}: {} available, {} = {}",
                server.ip,
                format_capacity(fitted),
                key,
                format_capacity(required)
            ),
        )
        .with_suggestion(Suggestion::with_fixes(
            format!("lower {key} to the available memory"),
            vec![FixEval::set(key, ConfigValue::from(format_capacity(fitted)), false)],
        )))
    }

    async fn check_runtime_dependency(
        &self,
        component: &str,
        server: &Server,
        shell: &dyn Shell,
    ) -> Result<CheckItem> {
        let Some(dependency) = &self.profile.runtime_dependency else {
            return Ok(CheckItem::pass(Some(component), &server.name, RUNTIME_DEPENDENCY_CHECK));
        };

        let result = shell
            .run(Command::shell(format!("{} --version 2>&1", dependency.binary)))
            .await?;
        let installed = result.success().then(|| parse_version(&result.stdout)).flatten();
        let required = parse_version(&dependency.min_version);

        match (installed, required) {
            (Some(installed), Some(required)) if installed >= required => {
                Ok(CheckItem::pass(Some(component), &server.name, RUNTIME_DEPENDENCY_CHECK))
            }
            (Some(installed), _) => Ok(CheckItem::fail(
                Some(component),
                &server.name,
                RUNTIME_DEPENDENCY_CHECK,
                "RUNTIME_DEPENDENCY",
                format!(
                    "{}: {} {} is older than {}",
                    server.ip,
                    dependency.binary,
                    join_version(&installed),
                    dependency.min_version
                ),
            )
            .with_suggestion(Suggestion::manual(format!(
                "upgrade {} to {} or later",
                dependency.binary, dependency.min_version
            )))),
            (None, _) => Ok(CheckItem::fail(
                Some(component),
                &server.name,
                RUNTIME_DEPENDENCY_CHECK,
                "RUNTIME_DEPENDENCY",
                format!("{}: {} is not installed", server.ip, dependency.binary),
            )
            .with_suggestion(Suggestion::manual(format!("install {}", dependency.binary)))),
        }
    }

    fn render_command(&self, component: &str, server: &Server, settings: &ConfigMap) -> Result<String> {
        let template = match &self.profile.command {
            Some(template) => template.clone(),
            None => settings
                .get("command")
                .and_then(scalar_string)
                .ok_or_else(|| {
                    Error::validation(format!("component '{component}' on {} has no command", server.name))
                })?,
        };

        let mut missing = None;
        let rendered = placeholder_pattern().replace_all(&template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match settings.get(key).and_then(scalar_string) {
                Some(value) => value,
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });

        if let Some(key) = missing {
            return Err(Error::validation(format!(
                "component '{component}' on {}: command references unset '{key}'",
                server.name
            )));
        }
        Ok(rendered.into_owned())
    }
}

#[async_trait]
impl ComponentPlugin for GenericComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_items(&self) -> Vec<String> {
        [PORT_CHECK, DISK_CHECK, MEMORY_CHECK, RUNTIME_DEPENDENCY_CHECK]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn generate(&self, input: GenerateInput<'_>) -> Result<GenerateOutput> {
        let GenerateInput {
            deployment,
            component,
            spec,
        } = input;
        spec.validate(component)?;

        let mut config = GeneratedConfig {
            global: spec.global.clone(),
            servers: IndexMap::new(),
        };
        let mut param_checks = Vec::new();

        for server in &spec.servers {
            let mut settings = spec.effective(&server.name);

            for (key, def) in self.profile.params.iter() {
                if !settings.contains_key(key) {
                    if let Some(default) = &def.default {
                        settings.insert(key.clone(), default.clone());
                    }
                }
                let issue = self.profile.params.check(key, settings.get(key));
                param_checks.push(self.param_item(component, spec, &server.name, key, issue));
            }

            config.servers.insert(server.name.clone(), settings);
        }

        debug!(
            deployment,
            component,
            servers = spec.servers.len(),
            params = param_checks.len(),
            "component config generated"
        );

        Ok(GenerateOutput {
            config,
            param_checks,
            required_components: self.profile.requires.clone(),
        })
    }

    async fn validate(&self, input: ValidateInput) -> Result<Vec<CheckItem>> {
        let checks = input.servers.iter().map(|(server, shell)| {
            let settings = input.config.effective(&server.name);
            let component = input.component.as_str();
            async move { self.check_server(component, server, shell.as_ref(), &settings).await }
        });

        Ok(join_all(checks).await.into_iter().flatten().collect())
    }

    fn process_spec(&self, component: &str, server: &Server, config: &ConfigMap) -> Result<ProcessSpec> {
        let home = config
            .get(&self.profile.home_key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::validation(format!(
                    "component '{component}' on {} has no {}",
                    server.name, self.profile.home_key
                ))
            })?;
        let command = self.render_command(component, server, config)?;

        Ok(ProcessSpec::new(component, home, command)
            .with_ports(self.ports(config))
            .with_kill_group(self.profile.kill_group))
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("valid regex"))
}

/// First dotted version number in `text`, missing parts as zero
pub fn parse_version(text: &str) -> Option<[u64; 3]> {
    let caps = version_pattern().captures(text)?;
    let mut version = [0; 3];
    for (i, part) in version.iter_mut().enumerate() {
        if let Some(m) = caps.get(i + 1) {
            *part = m.as_str().parse().ok()?;
        }
    }
    Some(version)
}

fn join_version(version: &[u64; 3]) -> String {
    format!("{}.{}.{}", version[0], version[1], version[2])
}

fn parse_meminfo(line: &str) -> Option<u64> {
    // MemAvailable:   16318500 kB
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    kb.checked_mul(1024)
}

fn scalar_string(value: &ConfigValue) -> Option<String> {
    match value {
        ConfigValue::String(s) => Some(s.clone()),
        ConfigValue::Number(n) => Some(n.to_string()),
        ConfigValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Plugins by component name
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ComponentPlugin>>,
    default: Arc<dyn ComponentPlugin>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// A registry where every component uses a default [`GenericComponent`]
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
            default: Arc::new(GenericComponent::new("generic", ComponentProfile::default())),
        }
    }

    /// One [`GenericComponent`] per profile
    pub fn from_profiles(profiles: &IndexMap<String, ComponentProfile>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, profile) in profiles {
            registry.register(name, Arc::new(GenericComponent::new(name, profile.clone())))?;
        }
        Ok(registry)
    }

    /// Register a plugin for a component name
    pub fn register(&mut self, component: impl Into<String>, plugin: Arc<dyn ComponentPlugin>) -> Result<()> {
        let component = component.into();
        if self.plugins.contains_key(&component) {
            return Err(Error::validation(format!(
                "plugin for component '{component}' already registered"
            )));
        }
        self.plugins.insert(component, plugin);
        Ok(())
    }

    /// Replace the fallback plugin
    pub fn with_default(mut self, plugin: Arc<dyn ComponentPlugin>) -> Self {
        self.default = plugin;
        self
    }

    /// The plugin for a component, or the fallback
    pub fn get(&self, component: &str) -> Arc<dyn ComponentPlugin> {
        self.plugins
            .get(component)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Whether a dedicated plugin is registered
    pub fn contains(&self, component: &str) -> bool {
        self.plugins.contains_key(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckStatus, FixOp};
    use deploy_config::{ParamDef, ParamKind};
    use process_coordinator::testing::FakeHost;
    use command_executor::ExitResult;

    fn profile() -> ComponentProfile {
        ComponentProfile {
            command: Some("bin/observer -p ${port} -d ${home_path}".to_string()),
            memory_key: Some("memory_limit".to_string()),
            params: ParamSchema::new()
                .with("home_path", ParamDef::new(ParamKind::Path).required())
                .with("port", ParamDef::new(ParamKind::Port).with_default(2881))
                .with(
                    "cpu_count",
                    ParamDef::new(ParamKind::Integer)
                        .with_default(16)
                        .with_range(Some(1), Some(64)),
                )
                .with("legacy_mode", ParamDef::new(ParamKind::Bool).deprecated()),
            ..ComponentProfile::default()
        }
    }

    fn spec(yaml: &str) -> ComponentSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_generate_fills_defaults_per_server() {
        let plugin = GenericComponent::new("observer", profile());
        let spec = spec(
            r#"
servers: [10.0.0.1, 10.0.0.2]
global:
  home_path: /home/admin/ob
10.0.0.2:
  port: 3881
"#,
        );

        let out = plugin
            .generate(GenerateInput {
                deployment: "prod",
                component: "observer",
                spec: &spec,
            })
            .unwrap();

        assert_eq!(out.config.servers["10.0.0.1"]["port"], ConfigValue::from(2881));
        assert_eq!(out.config.servers["10.0.0.2"]["port"], ConfigValue::from(3881));
        assert_eq!(out.config.servers["10.0.0.2"]["cpu_count"], ConfigValue::from(16));
        assert!(out.param_checks.iter().all(|i| i.status == CheckStatus::Pass));
        // 4 params on 2 servers
        assert_eq!(out.param_checks.len(), 8);
    }

    #[test]
    fn test_out_of_range_proposes_default() {
        let plugin = GenericComponent::new("observer", profile());
        let spec = spec(
            r#"
servers: [10.0.0.1]
global:
  home_path: /home/admin/ob
  cpu_count: 128
  legacy_mode: true
"#,
        );

        let out = plugin
            .generate(GenerateInput {
                deployment: "prod",
                component: "observer",
                spec: &spec,
            })
            .unwrap();

        let cpu = out.param_checks.iter().find(|i| i.name == "param:cpu_count").unwrap();
        assert_eq!(cpu.code.as_deref(), Some("PARAM_RANGE"));
        assert!(cpu.recoverable());
        let fix = &cpu.suggestions[0].fixes[0];
        assert_eq!(fix.op, FixOp::Set);
        assert_eq!(fix.value, Some(ConfigValue::from(16)));
        assert!(fix.is_global);

        let legacy = out.param_checks.iter().find(|i| i.name == "param:legacy_mode").unwrap();
        assert_eq!(legacy.suggestions[0].fixes[0].op, FixOp::Delete);
        assert!(legacy.recoverable());
    }

    #[test]
    fn test_missing_required_is_not_recoverable() {
        let plugin = GenericComponent::new("observer", profile());
        let spec = spec("servers: [10.0.0.1]\n");

        let out = plugin
            .generate(GenerateInput {
                deployment: "prod",
                component: "observer",
                spec: &spec,
            })
            .unwrap();

        let home = out.param_checks.iter().find(|i| i.name == "param:home_path").unwrap();
        assert_eq!(home.code.as_deref(), Some("PARAM_REQUIRED"));
        assert!(!home.recoverable());
    }

    #[test]
    fn test_process_spec_renders_command() {
        let plugin = GenericComponent::new("observer", profile());
        let mut settings = ConfigMap::new();
        settings.insert("home_path".into(), ConfigValue::from("/home/admin/ob"));
        settings.insert("port".into(), ConfigValue::from(2881));

        let spec = plugin
            .process_spec("observer", &Server::new("10.0.0.1"), &settings)
            .unwrap();
        assert_eq!(spec.command, "bin/observer -p 2881 -d /home/admin/ob");
        assert_eq!(spec.ports, vec![2881]);

        settings.shift_remove("port");
        assert!(plugin
            .process_spec("observer", &Server::new("10.0.0.1"), &settings)
            .is_err());
    }

    #[smol_potat::test]
    async fn test_runtime_checks() {
        let plugin = GenericComponent::new("observer", profile());
        let host = Arc::new(FakeHost::new("10.0.0.1"));
        host.spawn("nc -l 2881", &[2881]);
        host.respond(
            "MemAvailable",
            ExitResult::ok("MemAvailable:    4194304 kB\n"),
        );

        let mut config = GeneratedConfig::default();
        config.global.insert("port".into(), ConfigValue::from(2881));
        config.global.insert("memory_limit".into(), ConfigValue::from("8G"));

        let items = plugin
            .validate(ValidateInput {
                component: "observer".to_string(),
                spec: ComponentSpec::default(),
                config,
                servers: vec![(Server::new("10.0.0.1"), host.clone() as Arc<dyn Shell>)],
            })
            .await
            .unwrap();

        let port = items.iter().find(|i| i.name == PORT_CHECK).unwrap();
        assert_eq!(port.code.as_deref(), Some("PORT_IN_USE"));

        let memory = items.iter().find(|i| i.name == MEMORY_CHECK).unwrap();
        assert_eq!(memory.code.as_deref(), Some("MEMORY_INSUFFICIENT"));
        let fix = &memory.suggestions[0].fixes[0];
        assert_eq!(fix.value, Some(ConfigValue::from("4G")));
        assert!(!fix.is_global);

        let disk = items.iter().find(|i| i.name == DISK_CHECK).unwrap();
        assert_eq!(disk.status, CheckStatus::Pass);
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(parse_version("Python 3.8.10"), Some([3, 8, 10]));
        assert_eq!(parse_version("openjdk version \"17\""), Some([17, 0, 0]));
        assert!(parse_version("1.8.0") < parse_version("1.11"));
        assert_eq!(parse_version("none"), None);
    }

    #[test]
    fn test_meminfo_parsing() {
        assert_eq!(parse_meminfo("MemAvailable:    4194304 kB\n"), Some(4096 * MB));
        assert_eq!(parse_meminfo(&format!("MemAvailable: {} kB", u64::MAX / 1024 + 1)), None);
        assert_eq!(parse_meminfo("MemAvailable: lots"), None);
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let mut profiles = IndexMap::new();
        profiles.insert("observer".to_string(), profile());
        let mut registry = PluginRegistry::from_profiles(&profiles).unwrap();

        assert_eq!(registry.get("observer").name(), "observer");
        assert_eq!(registry.get("proxy").name(), "generic");
        assert!(registry
            .register("observer", Arc::new(GenericComponent::new("observer", profile())))
            .is_err());
    }
}
