//! Collapsing per-server values into shared global settings
//!
//! Plugins generate a full key/value map for every server. Most keys end up
//! identical across servers, so storing them per server would make the
//! persisted configuration noisy and hard to edit. A value is promoted to
//! `global` once all but one of the servers agree on it; the odd one out keeps
//! a per-server override.
//!
//! Keys already present in the input's `global` are explicit user choices and
//! are never replaced by an inferred value.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::deployment::ComponentConfig;
use crate::spec::{ConfigMap, ConfigValue};

/// Generated configuration of one component, before or after reconciliation
pub type GeneratedConfig = ComponentConfig;

struct Candidate {
    value: ConfigValue,
    servers: Vec<String>,
}

/// Reconcile generated per-server values into `global` plus overrides
///
/// Servers are visited in the order of `generated.servers`, which callers
/// keep equal to the declared server order.
pub fn reconcile(generated: GeneratedConfig) -> GeneratedConfig {
    let GeneratedConfig {
        mut global,
        servers,
    } = generated;

    if servers.len() <= 1 {
        for values in servers.into_values() {
            global.extend(values);
        }
        return GeneratedConfig {
            global,
            servers: IndexMap::new(),
        };
    }

    let base = servers.len() - 1;
    let mut overrides: IndexMap<String, ConfigMap> = servers
        .keys()
        .map(|name| (name.clone(), ConfigMap::new()))
        .collect();
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (server, values) in &servers {
        for (key, value) in values {
            if let Some(existing) = global.get(key) {
                if existing != value {
                    insert_override(&mut overrides, server, key, value);
                }
                continue;
            }

            insert_override(&mut overrides, server, key, value);

            let count = match candidates.get_mut(key) {
                // First sighting stays an override until another server agrees
                None => {
                    candidates.insert(
                        key.clone(),
                        Candidate {
                            value: value.clone(),
                            servers: vec![server.clone()],
                        },
                    );
                    continue;
                }
                Some(candidate) if candidate.value == *value => {
                    candidate.servers.push(server.clone());
                    candidate.servers.len()
                }
                // Diverging value: stays an override, candidate untouched
                Some(_) => continue,
            };

            if count == base {
                if let Some(candidate) = candidates.remove(key) {
                    tracing::trace!(key = %key, servers = candidate.servers.len(), "promoting to global");
                    for holder in &candidate.servers {
                        if let Some(map) = overrides.get_mut(holder) {
                            map.shift_remove(key);
                        }
                    }
                    global.insert(key.clone(), candidate.value);
                }
            }
        }
    }

    overrides.retain(|_, map| !map.is_empty());

    GeneratedConfig {
        global,
        servers: overrides,
    }
}

fn insert_override(
    overrides: &mut IndexMap<String, ConfigMap>,
    server: &str,
    key: &str,
    value: &ConfigValue,
) {
    overrides
        .entry(server.to_string())
        .or_default()
        .insert(key.to_string(), value.clone());
}

/// Reconcile and hand the result to `commit` for persistence
///
/// The reconciled configuration is returned only when `commit` succeeds.
pub fn reconcile_and_commit<F, E>(generated: GeneratedConfig, commit: F) -> Result<GeneratedConfig, E>
where
    F: FnOnce(&GeneratedConfig) -> Result<(), E>,
{
    let reconciled = reconcile(generated);
    commit(&reconciled)?;
    Ok(reconciled)
}
