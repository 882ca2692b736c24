//! Named deployment steps
//!
//! Operations run components through steps looked up by `(component, step)`,
//! falling back to handlers registered for every component under `*`.
//! Results are recorded in the [`NamespaceStore`]; an idempotent step that
//! already succeeded is not run again.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use deploy_config::{ComponentSpec, GeneratedConfig};
use indexmap::IndexMap;
use process_coordinator::{Coordinator, Error as CoordinatorError, ProcessTarget, ServerTarget};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::namespace::{NamespaceStore, StepRecord};
use crate::plugin::ComponentPlugin;
use crate::precheck::Connections;
use crate::{Error, Result};

/// Component name matching every component
pub const WILDCARD: &str = "*";

/// Start the component on every server and confirm its ports
pub const START_STEP: &str = "start";
/// Stop the component on every server
pub const STOP_STEP: &str = "stop";
/// Report the component's processes
pub const DISPLAY_STEP: &str = "display";

/// Everything a step needs about one component
#[derive(Clone)]
pub struct StepContext {
    /// Deployment name
    pub deployment: String,
    /// Component name
    pub component: String,
    /// High-level spec
    pub spec: ComponentSpec,
    /// Reconciled low-level config
    pub config: GeneratedConfig,
    /// The component's plugin
    pub plugin: Arc<dyn ComponentPlugin>,
    /// Shells by server address
    pub connections: Connections,
    /// Process lifecycle driver
    pub coordinator: Coordinator,
}

impl StepContext {
    /// One process target per server
    pub fn targets(&self) -> Result<Vec<ProcessTarget>> {
        self.spec
            .servers
            .iter()
            .map(|server| {
                let shell = self
                    .connections
                    .get(&server.ip)
                    .cloned()
                    .ok_or_else(|| Error::connectivity(&server.ip, "not connected"))?;
                let settings = self.config.effective(&server.name);
                let spec = self.plugin.process_spec(&self.component, server, &settings)?;
                Ok(ProcessTarget::new(
                    ServerTarget::new(&server.name, &server.ip, shell),
                    spec,
                ))
            })
            .collect()
    }
}

/// A step implementation
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step
    async fn run(&self, ctx: &StepContext) -> Result<Value>;

    /// Whether a recorded success may stand in for running again
    fn idempotent(&self) -> bool {
        true
    }
}

type StepFn = Box<dyn Fn(StepContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Adapts a closure into a [`StepHandler`]
pub struct FnStep {
    f: StepFn,
    idempotent: bool,
}

impl FnStep {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| {
                Box::pin(f(ctx)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
            }),
            idempotent: true,
        }
    }

    /// Run on every call
    pub fn always_run(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

#[async_trait]
impl StepHandler for FnStep {
    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        (self.f)(ctx.clone()).await
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }
}

/// Start and health-check on every server
pub struct StartStep;

#[async_trait]
impl StepHandler for StartStep {
    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let targets = ctx.targets()?;
        let report = ctx.coordinator.start_all(&targets).await;
        if !report.is_success() {
            return Err(Error::from_failures("start", report.failed));
        }

        let handles: Vec<_> = report.succeeded.into_iter().map(|(_, h)| h).collect();
        info!(deployment = %ctx.deployment, component = %ctx.component, servers = handles.len(), "component started");
        Ok(serde_json::to_value(handles)?)
    }
}

/// Stop on every server
///
/// A killed process whose ports are still held is reported under
/// `port_not_released` in the step value; other failures fail the step.
pub struct StopStep;

#[async_trait]
impl StepHandler for StopStep {
    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let targets = ctx.targets()?;
        let report = ctx.coordinator.stop_all(&targets).await;

        let mut servers = serde_json::Map::new();
        let mut failed = Vec::new();
        for failure in report.failed {
            match failure.error {
                CoordinatorError::PortNotReleased { pid, ports, .. } => {
                    warn!(
                        deployment = %ctx.deployment,
                        component = %ctx.component,
                        server = %failure.server,
                        pid,
                        ?ports,
                        "port not released after stop"
                    );
                    servers.insert(
                        failure.server,
                        json!({ "port_not_released": { "pid": pid, "ports": ports } }),
                    );
                }
                _ => failed.push(failure),
            }
        }
        if !failed.is_empty() {
            return Err(Error::from_failures("stop", failed));
        }

        for (server, outcome) in report.succeeded {
            servers.insert(server, serde_json::to_value(outcome)?);
        }
        info!(deployment = %ctx.deployment, component = %ctx.component, "component stopped");
        Ok(Value::Object(servers))
    }
}

/// Inspect processes on every server
pub struct DisplayStep;

#[async_trait]
impl StepHandler for DisplayStep {
    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let targets = ctx.targets()?;
        let report = ctx.coordinator.status_all(&targets).await;

        let mut servers = serde_json::Map::new();
        for (server, status) in report.succeeded {
            servers.insert(server, serde_json::to_value(status)?);
        }
        for failure in report.failed {
            servers.insert(failure.server, json!({ "error": failure.error.to_string() }));
        }
        Ok(Value::Object(servers))
    }

    fn idempotent(&self) -> bool {
        false
    }
}

/// Step handlers by component and step name
#[derive(Default)]
pub struct StepRegistry {
    handlers: IndexMap<(String, String), Arc<dyn StepHandler>>,
}

impl StepRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `start`, `stop` and `display` for every component
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, Arc<dyn StepHandler>); 3] = [
            (START_STEP, Arc::new(StartStep)),
            (STOP_STEP, Arc::new(StopStep)),
            (DISPLAY_STEP, Arc::new(DisplayStep)),
        ];
        for (step, handler) in builtins {
            registry
                .handlers
                .insert((WILDCARD.to_string(), step.to_string()), handler);
        }
        registry
    }

    /// Register a handler; `component` may be [`WILDCARD`]
    pub fn register(
        &mut self,
        component: impl Into<String>,
        step: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let key = (component.into(), step.into());
        if self.handlers.contains_key(&key) {
            return Err(Error::validation(format!(
                "step '{}' already registered for '{}'",
                key.1, key.0
            )));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// The handler for a step, exact match first
    pub fn resolve(&self, component: &str, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers
            .get(&(component.to_string(), step.to_string()))
            .or_else(|| self.handlers.get(&(WILDCARD.to_string(), step.to_string())))
            .cloned()
    }

    /// Run a step for `ctx.component`, recording the outcome
    pub async fn run_step(&self, namespace: &NamespaceStore, step: &str, ctx: &StepContext) -> Result<Value> {
        let handler = self
            .resolve(&ctx.component, step)
            .ok_or_else(|| Error::StepNotFound {
                component: ctx.component.clone(),
                step: step.to_string(),
            })?;

        if handler.idempotent() {
            if let Some(record) = namespace
                .get(&ctx.deployment, &ctx.component, step)
                .filter(|r| r.success)
            {
                debug!(deployment = %ctx.deployment, component = %ctx.component, step, "step already completed");
                return Ok(record.value);
            }
        }

        match handler.run(ctx).await {
            Ok(value) => {
                namespace.record(&ctx.deployment, &ctx.component, step, StepRecord::success(value.clone()));
                Ok(value)
            }
            Err(e) => {
                warn!(deployment = %ctx.deployment, component = %ctx.component, step, error = %e, "step failed");
                namespace.record(&ctx.deployment, &ctx.component, step, StepRecord::failure(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ComponentProfile, GenericComponent};
    use deploy_config::{ConfigValue, Server};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> StepContext {
        let mut config = GeneratedConfig::default();
        config.global.insert("home_path".into(), ConfigValue::from("/opt/proxy"));
        config.global.insert("command".into(), ConfigValue::from("bin/proxy"));
        StepContext {
            deployment: "prod".to_string(),
            component: "proxy".to_string(),
            spec: ComponentSpec::with_servers(vec![Server::new("10.0.0.1")]),
            config,
            plugin: Arc::new(GenericComponent::new("proxy", ComponentProfile::default())),
            connections: Connections::new(),
            coordinator: Coordinator::default(),
        }
    }

    #[smol_potat::test]
    async fn test_completed_step_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StepRegistry::new();
        registry
            .register(
                "proxy",
                "bootstrap",
                Arc::new(FnStep::new(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("done"))
                    }
                })),
            )
            .unwrap();

        let namespace = NamespaceStore::new();
        let ctx = context();
        registry.run_step(&namespace, "bootstrap", &ctx).await.unwrap();
        let value = registry.run_step(&namespace, "bootstrap", &ctx).await.unwrap();

        assert_eq!(value, json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        namespace.clear("prod");
        registry.run_step(&namespace, "bootstrap", &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[smol_potat::test]
    async fn test_failures_are_recorded_and_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StepRegistry::new();
        registry
            .register(
                WILDCARD,
                "bootstrap",
                Arc::new(FnStep::new(move |_| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(Error::invalid_state("not yet"))
                        } else {
                            Ok(Value::Null)
                        }
                    }
                })),
            )
            .unwrap();

        let namespace = NamespaceStore::new();
        let ctx = context();
        assert!(registry.run_step(&namespace, "bootstrap", &ctx).await.is_err());
        assert!(!namespace.is_completed("prod", "proxy", "bootstrap"));

        registry.run_step(&namespace, "bootstrap", &ctx).await.unwrap();
        assert!(namespace.is_completed("prod", "proxy", "bootstrap"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[smol_potat::test]
    async fn test_unknown_step() {
        let registry = StepRegistry::with_builtins();
        let err = registry
            .run_step(&NamespaceStore::new(), "migrate", &context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepNotFound { .. }));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StepRegistry::with_builtins();
        assert!(registry.register(WILDCARD, START_STEP, Arc::new(StartStep)).is_err());
        registry.register("proxy", START_STEP, Arc::new(StartStep)).unwrap();
        assert!(registry.resolve("observer", STOP_STEP).is_some());
    }

    #[test]
    fn test_targets_require_connections() {
        let ctx = context();
        assert!(matches!(ctx.targets(), Err(Error::Connectivity { .. })));
    }
}
