//! Precheck state machine
//!
//! `Init -> Connect -> Generate -> Validate -> Done`. A failing phase ends the
//! run: later phases are never entered. Results accumulate on the
//! [`CheckBoard`] of a [`PrecheckContext`], which stays in the
//! [`PrecheckContextStore`] afterwards so recovery can work from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use command_executor::Shell;
use deploy_config::{
    ComponentSpec, DeploymentSpec, DeploymentStore, GeneratedConfig, Server, reconcile,
};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::{Error, Result};
use crate::check::{
    CheckBoard, CheckItem, CheckSource, CheckStatus, GENERATE_ITEM, PrecheckResultView, SSH_ITEM,
    Suggestion,
};
use crate::connector::Connector;
use crate::plugin::{GenerateInput, PluginRegistry, ValidateInput};
use crate::task::TaskContext;

/// Server label of items that concern a whole component
pub const ALL_SERVERS: &str = "*";

/// Phase names reported as task steps
pub const PHASES: [&str; 4] = ["init", "connect", "generate", "validate"];

/// Open shells by server address
pub type Connections = HashMap<String, Arc<dyn Shell>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State of one precheck run, kept for recovery
pub struct PrecheckContext {
    board: Mutex<CheckBoard>,
    spec: Mutex<DeploymentSpec>,
    scope: Option<Vec<String>>,
}

impl PrecheckContext {
    /// A context checking every component of `spec`
    pub fn new(spec: DeploymentSpec) -> Self {
        Self {
            board: Mutex::new(CheckBoard::new()),
            spec: Mutex::new(spec),
            scope: None,
        }
    }

    /// Restrict the run to some components
    pub fn with_scope(mut self, components: Vec<String>) -> Self {
        self.scope = Some(components);
        self
    }

    /// Components the run covers, `None` meaning all
    pub fn scope(&self) -> Option<&[String]> {
        self.scope.as_deref()
    }

    /// Lock the board
    pub fn board(&self) -> MutexGuard<'_, CheckBoard> {
        lock(&self.board)
    }

    /// The spec as of the last phase, including auto-added components
    pub fn spec(&self) -> DeploymentSpec {
        lock(&self.spec).clone()
    }

    /// Replace the spec
    pub fn set_spec(&self, spec: DeploymentSpec) {
        *lock(&self.spec) = spec;
    }

    /// Report for clients
    pub fn view(&self) -> PrecheckResultView {
        self.board().view()
    }

    fn in_scope(&self, component: &str) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|scope| scope.iter().any(|c| c == component))
    }
}

/// Latest precheck context per deployment
#[derive(Default)]
pub struct PrecheckContextStore {
    contexts: Mutex<HashMap<String, Arc<PrecheckContext>>>,
}

impl PrecheckContextStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a context, replacing the previous one
    pub fn insert(&self, subject: &str, context: Arc<PrecheckContext>) {
        lock(&self.contexts).insert(subject.to_string(), context);
    }

    /// The latest context
    pub fn get(&self, subject: &str) -> Option<Arc<PrecheckContext>> {
        lock(&self.contexts).get(subject).cloned()
    }

    /// Drop the context
    pub fn remove(&self, subject: &str) -> Option<Arc<PrecheckContext>> {
        lock(&self.contexts).remove(subject)
    }
}

/// Phase that ended a run before Validate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltedPhase {
    /// At least one server could not be reached
    Connect,
    /// Generation or parameter validation failed
    Generate,
}

/// Result of a precheck run
pub struct PrecheckOutcome {
    /// Every observed item passed
    pub all_passed: bool,
    /// Set when a whole phase failed and later phases were skipped
    pub halted: Option<HaltedPhase>,
    /// Shells opened during Connect
    pub connections: Connections,
    /// Components generated, dependencies first
    pub components: Vec<String>,
    /// Spec including auto-added components
    pub spec: DeploymentSpec,
}

impl PrecheckOutcome {
    /// The task error for a run that stopped before Validate
    pub fn halt_error(&self, context: &PrecheckContext) -> Option<Error> {
        let board = context.board();
        match self.halted? {
            HaltedPhase::Connect => {
                let unreachable: Vec<&str> = board
                    .failures()
                    .filter(|item| item.name == SSH_ITEM)
                    .map(|item| item.server.as_str())
                    .collect();
                Some(Error::connectivity(unreachable.join(", "), "SSH connection failed"))
            }
            HaltedPhase::Generate => Some(Error::validation(format!(
                "config generation failed: {}",
                board.summary()
            ))),
        }
    }
}

/// Runs the precheck phases for one deployment
pub struct PrecheckEngine<'a> {
    store: &'a DeploymentStore,
    plugins: &'a PluginRegistry,
    connector: &'a dyn Connector,
    concurrency: usize,
}

impl<'a> PrecheckEngine<'a> {
    /// Create an engine
    pub fn new(
        store: &'a DeploymentStore,
        plugins: &'a PluginRegistry,
        connector: &'a dyn Connector,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            plugins,
            connector,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every phase, stopping at the first that fails
    pub async fn run(
        &self,
        subject: &str,
        context: &PrecheckContext,
        task: Option<&TaskContext>,
    ) -> Result<PrecheckOutcome> {
        let mut spec = context.spec();
        let mut outcome = PrecheckOutcome {
            all_passed: false,
            halted: None,
            connections: Connections::new(),
            components: Vec::new(),
            spec: spec.clone(),
        };

        let servers = phase(task, "init", || Ok(self.init(&spec, context)), |_| true)?;

        let connect = self.connect(&spec, &servers, context, &mut outcome.connections);
        if !phase_async(task, "connect", connect, |connected| *connected).await? {
            outcome.halted = Some(HaltedPhase::Connect);
            return Ok(self.finish(subject, context, outcome));
        }

        let generated = phase(
            task,
            "generate",
            || self.generate(subject, &mut spec, context),
            Option::is_some,
        )?;
        outcome.spec = spec.clone();
        context.set_spec(spec.clone());
        let Some(generated) = generated else {
            outcome.halted = Some(HaltedPhase::Generate);
            return Ok(self.finish(subject, context, outcome));
        };

        outcome.components = generated.keys().cloned().collect();
        let validate = self.validate(subject, &spec, generated, context, &outcome.connections);
        phase_async(task, "validate", validate, |_| true).await?;

        Ok(self.finish(subject, context, outcome))
    }

    fn finish(&self, subject: &str, context: &PrecheckContext, mut outcome: PrecheckOutcome) -> PrecheckOutcome {
        let mut board = context.board();
        board.finish();
        outcome.all_passed = board.all_passed();
        info!(deployment = subject, passed = outcome.all_passed, summary = %board.summary(), "precheck finished");
        outcome
    }

    /// Announce every check and return the servers to connect to
    fn init(&self, spec: &DeploymentSpec, context: &PrecheckContext) -> Vec<Server> {
        let mut board = context.board();
        let mut seen = HashSet::new();
        let mut servers = Vec::new();

        for (name, component) in &spec.components {
            if !context.in_scope(name) {
                continue;
            }
            let items = self.plugins.get(name).check_items();
            for server in &component.servers {
                for item in &items {
                    board.announce(name, &server.name, item);
                }
                if seen.insert(server.ip.clone()) {
                    servers.push(server.clone());
                }
            }
        }

        for server in &servers {
            board.record(CheckSource::Connect, CheckItem::wait(None, &server.ip, SSH_ITEM));
        }
        debug!(servers = servers.len(), "precheck initialized");
        servers
    }

    /// Connect to every server; `false` if any could not be reached
    async fn connect(
        &self,
        spec: &DeploymentSpec,
        servers: &[Server],
        context: &PrecheckContext,
        connections: &mut Connections,
    ) -> Result<bool> {
        let user = &spec.user;
        let results: Vec<(Server, Result<Arc<dyn Shell>>)> = stream::iter(servers.iter().cloned())
            .map(|server| async move {
                let result = self.connector.connect(&server, user).await;
                (server, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut board = context.board();
        let mut all_connected = true;
        for (server, result) in results {
            match result {
                Ok(shell) => {
                    board.record(CheckSource::Connect, CheckItem::pass(None, &server.ip, SSH_ITEM));
                    connections.insert(server.ip.clone(), shell);
                }
                Err(e) => {
                    warn!(server = %server.name, ip = %server.ip, error = %e, "ssh connection failed");
                    all_connected = false;
                    board.record(
                        CheckSource::Connect,
                        CheckItem::fail(None, &server.ip, SSH_ITEM, "SSH_CONNECT_FAILED", e.to_string())
                            .with_suggestion(Suggestion::manual(format!(
                                "check that {} is reachable as {}",
                                server.ip, user.username
                            ))),
                    );
                }
            }
        }
        Ok(all_connected)
    }

    /// Generate and reconcile every in-scope component
    ///
    /// Returns `None` when generation or parameter validation failed.
    fn generate(
        &self,
        subject: &str,
        spec: &mut DeploymentSpec,
        context: &PrecheckContext,
    ) -> Result<Option<IndexMap<String, GeneratedConfig>>> {
        let mut queue: VecDeque<String> = spec
            .dependency_order()?
            .into_iter()
            .filter(|name| context.in_scope(name))
            .collect();

        let mut raw = IndexMap::new();
        let mut passed = true;

        while let Some(name) = queue.pop_front() {
            let component = spec.component(&name)?.clone();
            let plugin = self.plugins.get(&name);

            let output = match plugin.generate(GenerateInput {
                deployment: subject,
                component: &name,
                spec: &component,
            }) {
                Ok(output) => output,
                Err(e) => {
                    warn!(deployment = subject, component = %name, error = %e, "config generation failed");
                    context.board().record(
                        CheckSource::Param,
                        CheckItem::fail(Some(&name), ALL_SERVERS, GENERATE_ITEM, "GENERATE_FAILED", e.to_string()),
                    );
                    return Ok(None);
                }
            };

            for required in &output.required_components {
                if !spec.components.contains_key(required) {
                    info!(deployment = subject, component = %name, dependency = %required, "adding required component");
                    spec.components
                        .insert(required.clone(), ComponentSpec::with_servers(component.servers.clone()));
                    let items = self.plugins.get(required).check_items();
                    let mut board = context.board();
                    for server in &component.servers {
                        for item in &items {
                            board.announce(required, &server.name, item);
                        }
                    }
                    queue.push_back(required.clone());
                }
                let dependent = spec.component_mut(&name)?;
                if !dependent.depends.contains(required) {
                    dependent.depends.push(required.clone());
                }
            }

            passed &= output
                .param_checks
                .iter()
                .all(|item| item.status != CheckStatus::Fail);
            context.board().record_all(CheckSource::Param, output.param_checks);
            raw.insert(name, output.config);
        }

        if !passed {
            debug!(deployment = subject, "parameter validation failed");
            return Ok(None);
        }

        // Dependencies first, auto-added ones included
        let order = spec.dependency_order()?;
        let mut generated = IndexMap::new();
        for name in order {
            if let Some(config) = raw.shift_remove(&name) {
                generated.insert(name, reconcile(config));
            }
        }
        Ok(Some(generated))
    }

    /// Persist the generated config, then run runtime checks
    async fn validate(
        &self,
        subject: &str,
        spec: &DeploymentSpec,
        generated: IndexMap<String, GeneratedConfig>,
        context: &PrecheckContext,
        connections: &Connections,
    ) -> Result<()> {
        self.store.update(subject, |deployment| {
            deployment.spec = spec.clone();
            for (name, config) in &generated {
                deployment.generated.insert(name.clone(), config.clone());
            }
            Ok(())
        })?;

        for (name, config) in generated {
            let component = spec.component(&name)?.clone();
            let servers = attach(&component.servers, connections);
            let plugin = self.plugins.get(&name);

            let items = match plugin
                .validate(ValidateInput {
                    component: name.clone(),
                    spec: component,
                    config,
                    servers,
                })
                .await
            {
                Ok(items) => items,
                Err(e) => vec![CheckItem::fail(
                    Some(&name),
                    ALL_SERVERS,
                    "validate",
                    "VALIDATE_FAILED",
                    e.to_string(),
                )],
            };
            context.board().record_all(CheckSource::Runtime, items);
        }
        Ok(())
    }
}

/// Pair servers with their open shells, skipping unconnected ones
pub fn attach(servers: &[Server], connections: &Connections) -> Vec<(Server, Arc<dyn Shell>)> {
    servers
        .iter()
        .filter_map(|s| connections.get(&s.ip).map(|shell| (s.clone(), shell.clone())))
        .collect()
}

/// Run a phase as a task step; `passed` decides the step's result on `Ok`
fn phase<T>(
    task: Option<&TaskContext>,
    name: &str,
    f: impl FnOnce() -> Result<T>,
    passed: impl FnOnce(&T) -> bool,
) -> Result<T> {
    if let Some(task) = task {
        task.begin_step(name);
    }
    let result = f();
    if let Some(task) = task {
        task.finish_step(name, result.as_ref().is_ok_and(passed));
    }
    result
}

async fn phase_async<T>(
    task: Option<&TaskContext>,
    name: &str,
    fut: impl std::future::Future<Output = Result<T>>,
    passed: impl FnOnce(&T) -> bool,
) -> Result<T> {
    if let Some(task) = task {
        task.begin_step(name);
    }
    let result = fut.await;
    if let Some(task) = task {
        task.finish_step(name, result.as_ref().is_ok_and(passed));
    }
    result
}
