//! Applying automatic fixes from a precheck
//!
//! Only failing items whose first suggestion is marked `auto_fix` are touched.
//! Fixes edit the high-level spec; each touched component's low-level config
//! is then regenerated from it and committed to the store.

use std::collections::BTreeSet;

use deploy_config::{ConfigValue, DeploymentStore, reconcile_and_commit};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::check::{CheckItem, FixEval, FixOp};
use crate::plugin::{GenerateInput, PluginRegistry};
use crate::Result;
use crate::precheck::PrecheckContext;

/// One change made by recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAudit {
    /// Component changed
    pub component: String,
    /// Server the failing item was reported for
    pub server: String,
    /// Parameter key
    pub key: String,
    /// Value the server saw before
    pub old: Option<ConfigValue>,
    /// Value it sees now
    pub new: Option<ConfigValue>,
}

/// A fix that could not be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFix {
    /// Component of the failing item
    pub component: Option<String>,
    /// Server of the failing item
    pub server: String,
    /// Parameter key
    pub key: String,
    /// Why it was skipped
    pub reason: String,
}

/// What a recovery run did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Changes made, in order
    pub applied: Vec<FixAudit>,
    /// Fixes that could not be located
    pub skipped: Vec<SkippedFix>,
    /// Components whose config was regenerated
    pub regenerated: Vec<String>,
}

/// Applies fixes and regenerates configs
pub struct Recovery<'a> {
    store: &'a DeploymentStore,
    plugins: &'a PluginRegistry,
}

impl<'a> Recovery<'a> {
    /// Create a recovery run against a store
    pub fn new(store: &'a DeploymentStore, plugins: &'a PluginRegistry) -> Self {
        Self { store, plugins }
    }

    /// Apply every automatic fix recorded in `context`
    pub fn run(&self, subject: &str, context: &PrecheckContext) -> Result<RecoveryReport> {
        let items: Vec<CheckItem> = context
            .board()
            .failures()
            .filter(|item| item.recoverable())
            .cloned()
            .collect();

        let mut spec = context.spec();
        let mut report = RecoveryReport::default();
        let mut touched = BTreeSet::new();

        for item in &items {
            let Some(suggestion) = item.suggestions.first() else {
                continue;
            };
            for fix in &suggestion.fixes {
                match apply(&mut spec, item, fix) {
                    Ok(Some(audit)) => {
                        info!(
                            deployment = subject,
                            component = %audit.component,
                            server = %audit.server,
                            key = %audit.key,
                            "fix applied"
                        );
                        touched.insert(audit.component.clone());
                        report.applied.push(audit);
                    }
                    // Already in place, e.g. a global fix reported by several servers
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(
                            deployment = subject,
                            component = ?item.component,
                            server = %item.server,
                            key = %fix.key,
                            reason = %reason,
                            "fix skipped"
                        );
                        report.skipped.push(SkippedFix {
                            component: item.component.clone(),
                            server: item.server.clone(),
                            key: fix.key.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        let order = spec.dependency_order()?;
        for name in order.into_iter().filter(|n| touched.contains(n)) {
            let component = spec.component(&name)?.clone();
            let output = self.plugins.get(&name).generate(GenerateInput {
                deployment: subject,
                component: &name,
                spec: &component,
            })?;

            reconcile_and_commit(output.config, |config| {
                self.store.update(subject, |deployment| {
                    deployment.spec = spec.clone();
                    deployment.generated.insert(name.clone(), config.clone());
                    Ok(())
                })
            })?;
            report.regenerated.push(name);
        }

        context.set_spec(spec);

        if report.applied.is_empty() && report.skipped.is_empty() {
            info!(deployment = subject, "nothing to recover");
        } else {
            info!(
                deployment = subject,
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "recovery finished"
            );
        }
        Ok(report)
    }
}

/// Apply one fix to the spec
///
/// `Ok(None)` when the spec already had the outcome; `Err` with a reason when
/// the fix cannot be located.
fn apply(
    spec: &mut deploy_config::DeploymentSpec,
    item: &CheckItem,
    fix: &FixEval,
) -> std::result::Result<Option<FixAudit>, String> {
    let component_name = item
        .component
        .as_deref()
        .ok_or_else(|| "item is not bound to a component".to_string())?;
    let component = spec
        .components
        .get_mut(component_name)
        .ok_or_else(|| format!("component '{component_name}' not found"))?;
    if component.server(&item.server).is_none() {
        return Err(format!("server '{}' not found in '{component_name}'", item.server));
    }

    let server = item.server.as_str();
    let old = component.get(server, &fix.key).cloned();

    match fix.op {
        FixOp::Set => {
            let value = fix
                .value
                .clone()
                .ok_or_else(|| format!("no value to set for '{}'", fix.key))?;
            if fix.is_global {
                component.set_global(fix.key.as_str(), value);
                component.remove_server(server, &fix.key);
            } else {
                component.set_server(server, fix.key.as_str(), value);
            }
        }
        FixOp::Delete => {
            component.remove_global(&fix.key);
            component.remove_server(server, &fix.key);
        }
    }

    let new = component.get(server, &fix.key).cloned();
    if old == new {
        return Ok(None);
    }
    Ok(Some(FixAudit {
        component: component_name.to_string(),
        server: server.to_string(),
        key: fix.key.clone(),
        old,
        new,
    }))
}
