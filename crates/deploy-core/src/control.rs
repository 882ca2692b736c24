//! Deployment operations
//!
//! [`ControlPlane`] is the entry point the CLI talks to. Long operations are
//! submitted as tasks and return a [`TaskHandle`] at once; their progress is
//! read back with [`ControlPlane::task_status`]. Short operations run inline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_runtime_compat::Spawner;
use command_executor::{Command, shell_escape};
use deploy_config::{
    ComponentSpec, Deployment, DeploymentSpec, DeploymentStatus, DeploymentStore, Server,
};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use process_coordinator::{Coordinator, CoordinatorPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::check::PrecheckResultView;
use crate::connector::{Connector, SshConnector};
use crate::locks::OperationLocks;
use crate::namespace::{NamespaceSnapshot, NamespaceStore};
use crate::plugin::PluginRegistry;
use crate::precheck::{Connections, PrecheckContext, PrecheckContextStore, PrecheckEngine, PrecheckOutcome};
use crate::recover::{Recovery, RecoveryReport};
use crate::steps::{DISPLAY_STEP, START_STEP, STOP_STEP, StepContext, StepRegistry};
use crate::task::{TaskContext, TaskHandle, TaskKind, TaskRegistry, TaskStatusView};
use crate::{Error, Result};

const PRECHECK_LOCK: &str = "precheck";
const RECOVER_LOCK: &str = "recover";
const LIFECYCLE_LOCK: &str = "lifecycle";

fn default_concurrency() -> usize {
    10
}

/// Control plane settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Directory holding the deployment store
    pub home: PathBuf,
    /// Servers connected to at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Process start/stop bounds
    #[serde(default)]
    pub coordinator: CoordinatorPolicy,
}

impl ControlPlaneConfig {
    /// Default settings storing deployments under `home`
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            concurrency: default_concurrency(),
            coordinator: CoordinatorPolicy::default(),
        }
    }

    /// Set the connection fan-out limit
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the process coordinator bounds
    pub fn with_coordinator(mut self, policy: CoordinatorPolicy) -> Self {
        self.coordinator = policy;
        self
    }
}

/// Builds a [`ControlPlane`]
pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    spawner: Option<Arc<dyn Spawner>>,
    connector: Option<Arc<dyn Connector>>,
    plugins: PluginRegistry,
    steps: StepRegistry,
}

impl ControlPlaneBuilder {
    /// Runtime used for task bodies; defaults to the compiled-in runtime
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// How servers are reached; defaults to [`SshConnector`]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Component plugins
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Step handlers; defaults to the built-in ones
    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Finish building
    pub fn build(self) -> Result<ControlPlane> {
        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => async_runtime_compat::default_spawner()
                .ok_or_else(|| Error::invalid_state("no async runtime available for background tasks"))?,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SshConnector::new()));

        info!(home = %self.config.home.display(), concurrency = self.config.concurrency, "control plane ready");

        Ok(ControlPlane {
            inner: Arc::new(Inner {
                store: DeploymentStore::new(&self.config.home),
                tasks: TaskRegistry::new(spawner),
                namespace: NamespaceStore::new(),
                locks: OperationLocks::new(),
                contexts: PrecheckContextStore::new(),
                plugins: self.plugins,
                steps: self.steps,
                connector,
                coordinator: Coordinator::new(self.config.coordinator.clone()),
                concurrency: self.config.concurrency.max(1),
            }),
        })
    }
}

/// Summary of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSummary {
    /// Component name
    pub name: String,
    /// Package version
    pub version: Option<String>,
    /// Server names
    pub servers: Vec<String>,
    /// Components it depends on
    pub depends: Vec<String>,
}

/// Summary of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSummary {
    /// Deployment name
    pub name: String,
    /// Lifecycle status
    pub status: DeploymentStatus,
    /// An upgrade is in progress
    pub upgrading: bool,
    /// Components, dependencies first
    pub components: Vec<ComponentSummary>,
    /// Recorded tasks
    pub tasks: Vec<(TaskKind, TaskStatusView)>,
    /// Recorded step outcomes
    pub steps: NamespaceSnapshot,
}

struct Inner {
    store: DeploymentStore,
    tasks: TaskRegistry,
    namespace: NamespaceStore,
    locks: OperationLocks,
    contexts: PrecheckContextStore,
    plugins: PluginRegistry,
    steps: StepRegistry,
    connector: Arc<dyn Connector>,
    coordinator: Coordinator,
    concurrency: usize,
}

/// Deployment control plane
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Inner>,
}

impl ControlPlane {
    /// Start building a control plane
    pub fn builder(config: ControlPlaneConfig) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            spawner: None,
            connector: None,
            plugins: PluginRegistry::new(),
            steps: StepRegistry::with_builtins(),
        }
    }

    /// The deployment store
    pub fn store(&self) -> &DeploymentStore {
        &self.inner.store
    }

    /// Store a deployment document
    ///
    /// Creates the deployment, or replaces the document of one that has not
    /// been installed yet.
    pub fn configure(&self, name: &str, spec: DeploymentSpec) -> Result<Deployment> {
        spec.validate()?;
        let store = &self.inner.store;

        if !store.exists(name) {
            return Ok(store.create(name, spec)?);
        }

        let existing = store.load(name)?;
        match existing.status {
            DeploymentStatus::Destroyed => Ok(store.create(name, spec)?),
            DeploymentStatus::Configured => {
                let mut deployment = existing;
                deployment.transition(DeploymentStatus::Configuring)?;
                deployment.spec = spec;
                deployment.generated.clear();
                deployment.transition(DeploymentStatus::Configured)?;
                store.save(&mut deployment)?;
                info!(deployment = name, "deployment reconfigured");
                self.inner.contexts.remove(name);
                Ok(deployment)
            }
            status => Err(Error::invalid_state(format!(
                "deployment '{name}' is {status}; its config can no longer be replaced"
            ))),
        }
    }

    /// Summary of a deployment
    pub fn status(&self, name: &str) -> Result<DeploymentSummary> {
        let deployment = self.inner.store.load(name)?;
        let order = deployment.spec.dependency_order()?;
        let components = order
            .iter()
            .filter_map(|c| deployment.spec.components.get(c).map(|spec| (c, spec)))
            .map(|(c, spec)| ComponentSummary {
                name: c.clone(),
                version: spec.version.clone(),
                servers: spec.servers.iter().map(|s| s.name.clone()).collect(),
                depends: spec.depends.clone(),
            })
            .collect();

        Ok(DeploymentSummary {
            name: deployment.name,
            status: deployment.status,
            upgrading: deployment.upgrading,
            components,
            tasks: self
                .inner
                .tasks
                .list(name)
                .into_iter()
                .map(|t| (t.kind, t.view()))
                .collect(),
            steps: self.inner.namespace.snapshot(name),
        })
    }

    /// Every stored deployment with its status
    pub fn list(&self) -> Result<Vec<(String, DeploymentStatus)>> {
        let store = &self.inner.store;
        store
            .list()?
            .into_iter()
            .map(|name| {
                let status = store.load(&name)?.status;
                Ok((name, status))
            })
            .collect()
    }

    /// Status of the `(name, kind)` task
    pub fn task_status(&self, name: &str, kind: TaskKind) -> Result<TaskStatusView> {
        self.inner
            .tasks
            .get(name, kind)
            .map(|t| t.view())
            .ok_or_else(|| Error::TaskNotFound {
                subject: name.to_string(),
                kind,
            })
    }

    /// Forget a finished task
    pub fn clear_task(&self, name: &str, kind: TaskKind) -> Result<bool> {
        self.inner.tasks.clear(name, kind)
    }

    /// Report of the latest precheck
    pub fn precheck_result(&self, name: &str) -> Result<PrecheckResultView> {
        self.inner
            .contexts
            .get(name)
            .map(|ctx| ctx.view())
            .ok_or_else(|| Error::TaskNotFound {
                subject: name.to_string(),
                kind: TaskKind::Precheck,
            })
    }

    /// Apply the automatic fixes proposed by the latest precheck
    pub async fn recover(&self, name: &str) -> Result<RecoveryReport> {
        let inner = &self.inner;
        inner
            .locks
            .serialized(RECOVER_LOCK, async {
                if inner.tasks.is_active(name, TaskKind::Precheck) {
                    return Err(Error::task_conflict(name, TaskKind::Precheck, "is still running"));
                }
                let context = inner
                    .contexts
                    .get(name)
                    .ok_or_else(|| Error::recovery("no precheck context"))?;
                Recovery::new(&inner.store, &inner.plugins).run(name, &context)
            })
            .await
    }

    /// Check the deployment against its servers in the background
    pub fn submit_precheck(&self, name: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        let inner = self.inner.clone();
        let subject = name.to_string();

        self.inner.tasks.submit(name, TaskKind::Precheck, move |task| async move {
            let context = Arc::new(PrecheckContext::new(deployment.spec));
            inner.contexts.insert(&subject, context.clone());
            let outcome = inner.run_precheck(&subject, &context, Some(&task)).await?;
            task.set_message(context.board().summary());
            debug!(deployment = %subject, passed = outcome.all_passed, "precheck task done");
            match outcome.halt_error(&context) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Install a configured deployment in the background
    pub fn submit_install(&self, name: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        if deployment.status != DeploymentStatus::Configured {
            return Err(Error::invalid_state(format!(
                "deployment '{name}' is {}; only a configured deployment can be installed",
                deployment.status
            )));
        }

        let inner = self.inner.clone();
        let subject = name.to_string();
        self.inner
            .tasks
            .submit(name, TaskKind::Install, move |task| async move { inner.install(&subject, &task).await })
    }

    /// Stop everything and remove it from the servers in the background
    pub fn submit_destroy(&self, name: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        if !deployment.status.can_transition_to(DeploymentStatus::Destroying) {
            return Err(Error::invalid_state(format!(
                "deployment '{name}' is {}; it cannot be destroyed now",
                deployment.status
            )));
        }

        let inner = self.inner.clone();
        let subject = name.to_string();
        self.inner
            .tasks
            .submit(name, TaskKind::Destroy, move |task| async move { inner.destroy(&subject, &task).await })
    }

    /// Stop and start every component again in the background
    pub fn submit_reinstall(&self, name: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        require_deployed(&deployment)?;

        let inner = self.inner.clone();
        let subject = name.to_string();
        self.inner
            .tasks
            .submit(name, TaskKind::Reinstall, move |task| async move { inner.reinstall(&subject, &task).await })
    }

    /// Move one component to another version in the background
    pub fn submit_upgrade(&self, name: &str, component: &str, version: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        require_deployed(&deployment)?;
        deployment.spec.component(component)?;

        let inner = self.inner.clone();
        let subject = name.to_string();
        let component = component.to_string();
        let version = version.to_string();
        self.inner.tasks.submit(name, TaskKind::Upgrade, move |task| async move {
            inner.upgrade(&subject, &component, &version, &task).await
        })
    }

    /// Add components to an installed deployment in the background
    pub fn submit_component_change(
        &self,
        name: &str,
        additions: IndexMap<String, ComponentSpec>,
    ) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        require_deployed(&deployment)?;
        if additions.is_empty() {
            return Err(Error::validation("no components to add"));
        }
        for (component, spec) in &additions {
            if deployment.spec.components.contains_key(component) {
                return Err(Error::validation(format!(
                    "component '{component}' is already part of '{name}'"
                )));
            }
            spec.validate(component)?;
        }

        let inner = self.inner.clone();
        let subject = name.to_string();
        self.inner.tasks.submit(name, TaskKind::ComponentChange, move |task| async move {
            inner.component_change(&subject, additions, &task).await
        })
    }

    /// Remove one component in the background
    pub fn submit_del_component(&self, name: &str, component: &str) -> Result<TaskHandle> {
        let deployment = self.inner.store.load(name)?;
        require_deployed(&deployment)?;
        deployment.spec.component(component)?;

        let dependents = deployment.spec.dependents_of(component);
        if !dependents.is_empty() {
            return Err(Error::validation(format!(
                "component '{component}' is required by {}",
                dependents.join(", ")
            )));
        }
        if deployment.spec.components.len() == 1 {
            return Err(Error::validation(format!(
                "'{component}' is the last component of '{name}'; destroy the deployment instead"
            )));
        }

        let inner = self.inner.clone();
        let subject = name.to_string();
        let component = component.to_string();
        self.inner.tasks.submit(name, TaskKind::DelComponent, move |task| async move {
            inner.del_component(&subject, &component, &task).await
        })
    }

    /// Start every component of an installed deployment
    pub async fn start(&self, name: &str) -> Result<IndexMap<String, Value>> {
        let inner = &self.inner;
        inner.locks.serialized(LIFECYCLE_LOCK, inner.start(name)).await
    }

    /// Stop every component of an installed deployment
    pub async fn stop(&self, name: &str) -> Result<IndexMap<String, Value>> {
        let inner = &self.inner;
        inner.locks.serialized(LIFECYCLE_LOCK, inner.stop(name)).await
    }

    /// Process status of every component
    pub async fn display(&self, name: &str) -> Result<IndexMap<String, Value>> {
        let inner = &self.inner;
        let deployment = inner.store.load(name)?;
        let order = deployment.spec.dependency_order()?;
        let connections = inner.connect(&deployment.spec, &order).await?;

        let mut result = IndexMap::new();
        for component in &order {
            let value = inner
                .run_step(&deployment, component, DISPLAY_STEP, &connections, None)
                .await?;
            result.insert(component.clone(), value);
        }
        Ok(result)
    }
}

fn require_deployed(deployment: &Deployment) -> Result<()> {
    if deployment.status.is_deployed() {
        Ok(())
    } else {
        Err(Error::invalid_state(format!(
            "deployment '{}' is {}; install it first",
            deployment.name, deployment.status
        )))
    }
}

impl Inner {
    fn set_status(&self, name: &str, status: DeploymentStatus) -> Result<()> {
        self.store.update(name, |d| d.transition(status))?;
        Ok(())
    }

    async fn run_precheck(
        &self,
        name: &str,
        context: &PrecheckContext,
        task: Option<&TaskContext>,
    ) -> Result<PrecheckOutcome> {
        let engine = PrecheckEngine::new(&self.store, &self.plugins, self.connector.as_ref(), self.concurrency);
        self.locks
            .serialized(PRECHECK_LOCK, engine.run(name, context, task))
            .await
    }

    /// Connect to every server hosting `components`
    async fn connect(&self, spec: &DeploymentSpec, components: &[String]) -> Result<Connections> {
        let mut seen = HashSet::new();
        let servers: Vec<Server> = components
            .iter()
            .filter_map(|c| spec.components.get(c))
            .flat_map(|c| c.servers.iter())
            .filter(|s| seen.insert(s.ip.clone()))
            .cloned()
            .collect();

        let user = &spec.user;
        let results: Vec<(Server, Result<Arc<dyn command_executor::Shell>>)> = stream::iter(servers)
            .map(|server| async move {
                let result = self.connector.connect(&server, user).await;
                (server, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut connections = Connections::new();
        let mut failures = Vec::new();
        for (server, result) in results {
            match result {
                Ok(shell) => {
                    connections.insert(server.ip, shell);
                }
                Err(e) => failures.push(e),
            }
        }

        match failures.len() {
            0 => Ok(connections),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Aggregate {
                operation: "connect".to_string(),
                failures: failures.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    fn step_context(&self, deployment: &Deployment, component: &str, connections: &Connections) -> Result<StepContext> {
        let spec = deployment.spec.component(component)?.clone();
        let config = deployment.generated.get(component).cloned().ok_or_else(|| {
            Error::invalid_state(format!(
                "component '{component}' of '{}' has no generated config; run precheck first",
                deployment.name
            ))
        })?;

        Ok(StepContext {
            deployment: deployment.name.clone(),
            component: component.to_string(),
            spec,
            config,
            plugin: self.plugins.get(component),
            connections: connections.clone(),
            coordinator: self.coordinator.clone(),
        })
    }

    async fn run_step(
        &self,
        deployment: &Deployment,
        component: &str,
        step: &str,
        connections: &Connections,
        task: Option<&TaskContext>,
    ) -> Result<Value> {
        let ctx = self.step_context(deployment, component, connections)?;
        let run = self.steps.run_step(&self.namespace, step, &ctx);
        match task {
            Some(task) => task.step(&format!("{step} {component}"), run).await,
            None => run.await,
        }
    }

    /// Run `step` fresh, ignoring an earlier recorded success
    async fn rerun_step(
        &self,
        deployment: &Deployment,
        component: &str,
        step: &str,
        connections: &Connections,
        task: Option<&TaskContext>,
    ) -> Result<Value> {
        self.namespace.clear_step(&deployment.name, component, step);
        self.run_step(deployment, component, step, connections, task).await
    }

    async fn stop_components(
        &self,
        deployment: &Deployment,
        components: &[String],
        connections: &Connections,
        task: Option<&TaskContext>,
    ) -> Result<IndexMap<String, Value>> {
        let mut stopped = IndexMap::new();
        for component in components.iter().rev() {
            let value = self
                .rerun_step(deployment, component, STOP_STEP, connections, task)
                .await?;
            stopped.insert(component.clone(), value);
        }
        Ok(stopped)
    }

    async fn start_components(
        &self,
        deployment: &Deployment,
        components: &[String],
        connections: &Connections,
        task: Option<&TaskContext>,
    ) -> Result<IndexMap<String, Value>> {
        let mut started = IndexMap::new();
        for component in components {
            let value = self
                .run_step(deployment, component, START_STEP, connections, task)
                .await?;
            started.insert(component.clone(), value);
        }
        Ok(started)
    }

    async fn install(&self, name: &str, task: &TaskContext) -> Result<()> {
        let spec = self.store.load(name)?.spec;
        let context = Arc::new(PrecheckContext::new(spec));
        self.contexts.insert(name, context.clone());

        task.begin_step("precheck");
        let outcome = self.run_precheck(name, &context, None).await;
        let passed = outcome.as_ref().is_ok_and(|o| o.all_passed);
        task.finish_step("precheck", passed);
        let outcome = outcome?;
        if !outcome.all_passed {
            return Err(Error::validation(format!(
                "precheck failed: {}",
                context.board().summary()
            )));
        }

        self.set_status(name, DeploymentStatus::Deploying)?;
        self.namespace.clear(name);

        let deployment = self.store.load(name)?;
        let order = deployment.spec.dependency_order()?;
        if let Err(e) = self
            .start_components(&deployment, &order, &outcome.connections, Some(task))
            .await
        {
            warn!(deployment = name, error = %e, "install failed");
            if let Err(revert) = self.set_status(name, DeploymentStatus::Configured) {
                warn!(deployment = name, error = %revert, "could not revert deployment status");
            }
            return Err(e);
        }

        self.set_status(name, DeploymentStatus::Deployed)?;
        self.set_status(name, DeploymentStatus::Running)?;
        task.set_message(format!("{} components running", order.len()));
        info!(deployment = name, components = order.len(), "deployment installed");
        Ok(())
    }

    async fn destroy(&self, name: &str, task: &TaskContext) -> Result<()> {
        let before = self.store.load(name)?.status;
        self.set_status(name, DeploymentStatus::Destroying)?;

        let deployment = self.store.load(name)?;
        let order = deployment.spec.dependency_order()?;

        // Nothing was ever started on the servers
        if before != DeploymentStatus::Configured {
            let installed: Vec<String> = order
                .iter()
                .filter(|c| deployment.generated.contains_key(*c))
                .cloned()
                .collect();
            let connections = self.connect(&deployment.spec, &installed).await?;
            self.stop_components(&deployment, &installed, &connections, Some(task))
                .await?;
            task.step("remove files", self.remove_home_paths(&deployment, &installed, &connections))
                .await?;
        }

        self.set_status(name, DeploymentStatus::Destroyed)?;
        self.namespace.clear(name);
        self.contexts.remove(name);
        info!(deployment = name, "deployment destroyed");
        Ok(())
    }

    async fn remove_home_paths(
        &self,
        deployment: &Deployment,
        components: &[String],
        connections: &Connections,
    ) -> Result<()> {
        let mut failures = Vec::new();
        for component in components {
            let ctx = self.step_context(deployment, component, connections)?;
            for target in ctx.targets()? {
                let home = target.spec.home_path.trim_end_matches('/');
                if home.is_empty() {
                    failures.push(format!("{}: refusing to remove '/'", target.server.name));
                    continue;
                }
                debug!(component = %component, server = %target.server.name, home, "removing home path");
                let script = format!("rm -rf {}", shell_escape(home));
                if let Err(e) = target.server.shell.run_checked(Command::shell(script)).await {
                    failures.push(format!("{}: {}", target.server.name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate {
                operation: "remove home paths".to_string(),
                failures,
            })
        }
    }

    async fn reinstall(&self, name: &str, task: &TaskContext) -> Result<()> {
        let deployment = self.store.load(name)?;
        let order = deployment.spec.dependency_order()?;

        self.namespace.clear(name);
        let connections = self.connect(&deployment.spec, &order).await?;
        self.stop_components(&deployment, &order, &connections, Some(task))
            .await?;
        self.start_components(&deployment, &order, &connections, Some(task))
            .await?;

        self.set_status(name, DeploymentStatus::Running)?;
        info!(deployment = name, "deployment reinstalled");
        Ok(())
    }

    async fn upgrade(&self, name: &str, component: &str, version: &str, task: &TaskContext) -> Result<()> {
        let deployment = self.store.update(name, |d| {
            d.upgrading = true;
            Ok(d.clone())
        })?;
        let from = deployment.spec.component(component)?.version.clone();
        info!(deployment = name, component, from = ?from, to = version, "upgrading component");

        let scope = vec![component.to_string()];
        let connections = self.connect(&deployment.spec, &scope).await?;
        self.stop_components(&deployment, &scope, &connections, Some(task))
            .await?;

        let deployment = self.store.update(name, |d| {
            d.spec.component_mut(component)?.version = Some(version.to_string());
            Ok(d.clone())
        })?;
        self.rerun_step(&deployment, component, START_STEP, &connections, Some(task))
            .await?;

        self.store.update(name, |d| {
            d.upgrading = false;
            d.transition(DeploymentStatus::Running)
        })?;
        task.set_message(format!("{component} upgraded to {version}"));
        Ok(())
    }

    async fn component_change(
        &self,
        name: &str,
        additions: IndexMap<String, ComponentSpec>,
        task: &TaskContext,
    ) -> Result<()> {
        let added: Vec<String> = additions.keys().cloned().collect();
        let existing: HashSet<String> = self.store.load(name)?.spec.components.into_keys().collect();
        let spec = self.store.update(name, |d| {
            for (component, spec) in additions {
                d.spec.components.insert(component, spec);
            }
            d.spec.validate()?;
            Ok(d.spec.clone())
        })?;

        let context = Arc::new(PrecheckContext::new(spec).with_scope(added.clone()));
        self.contexts.insert(name, context.clone());

        task.begin_step("precheck");
        let outcome = self.run_precheck(name, &context, None).await;
        let passed = outcome.as_ref().is_ok_and(|o| o.all_passed);
        task.finish_step("precheck", passed);

        let outcome = match outcome {
            Ok(outcome) if outcome.all_passed => outcome,
            Ok(_) => {
                // Includes dependencies the precheck added on its own
                let components: Vec<String> = context
                    .spec()
                    .components
                    .into_keys()
                    .filter(|c| !existing.contains(c))
                    .collect();
                self.forget_components(name, &components)?;
                return Err(Error::validation(format!(
                    "precheck failed: {}",
                    context.board().summary()
                )));
            }
            Err(e) => {
                self.forget_components(name, &added)?;
                return Err(e);
            }
        };

        let deployment = self.store.load(name)?;
        if let Err(e) = self
            .start_components(&deployment, &outcome.components, &outcome.connections, Some(task))
            .await
        {
            warn!(deployment = name, error = %e, "component change failed, rolling back");
            if let Err(stop) = self
                .stop_components(&deployment, &outcome.components, &outcome.connections, None)
                .await
            {
                warn!(deployment = name, error = %stop, "could not stop added components");
            }
            self.forget_components(name, &outcome.components)?;
            return Err(e);
        }

        self.set_status(name, DeploymentStatus::Running)?;
        task.set_message(format!("added {}", outcome.components.join(", ")));
        Ok(())
    }

    async fn del_component(&self, name: &str, component: &str, task: &TaskContext) -> Result<()> {
        let deployment = self.store.load(name)?;
        let scope = vec![component.to_string()];

        if deployment.generated.contains_key(component) {
            let connections = self.connect(&deployment.spec, &scope).await?;
            self.stop_components(&deployment, &scope, &connections, Some(task))
                .await?;
        }

        self.forget_components(name, &scope)?;
        task.set_message(format!("{component} removed"));
        Ok(())
    }

    /// Remove components from the stored spec and config
    fn forget_components(&self, name: &str, components: &[String]) -> Result<()> {
        self.store.update(name, |d| {
            for component in components {
                d.spec.components.shift_remove(component);
                d.generated.shift_remove(component);
            }
            for spec in d.spec.components.values_mut() {
                spec.depends.retain(|dep| !components.contains(dep));
            }
            Ok(())
        })?;
        for component in components {
            self.namespace.clear_component(name, component);
        }
        info!(deployment = name, components = ?components, "components removed");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<IndexMap<String, Value>> {
        let deployment = self.store.load(name)?;
        require_deployed(&deployment)?;
        let order = deployment.spec.dependency_order()?;
        let connections = self.connect(&deployment.spec, &order).await?;

        let mut started = IndexMap::new();
        for component in &order {
            let value = self
                .rerun_step(&deployment, component, START_STEP, &connections, None)
                .await?;
            started.insert(component.clone(), value);
        }

        self.set_status(name, DeploymentStatus::Running)?;
        info!(deployment = name, "deployment started");
        Ok(started)
    }

    async fn stop(&self, name: &str) -> Result<IndexMap<String, Value>> {
        let deployment = self.store.load(name)?;
        require_deployed(&deployment)?;
        let order = deployment.spec.dependency_order()?;
        let connections = self.connect(&deployment.spec, &order).await?;

        self.set_status(name, DeploymentStatus::Stopping)?;
        match self.stop_components(&deployment, &order, &connections, None).await {
            Ok(stopped) => {
                self.set_status(name, DeploymentStatus::Stopped)?;
                info!(deployment = name, "deployment stopped");
                Ok(stopped)
            }
            Err(e) => {
                if let Err(revert) = self.set_status(name, DeploymentStatus::Running) {
                    warn!(deployment = name, error = %revert, "could not revert deployment status");
                }
                Err(e)
            }
        }
    }
}
