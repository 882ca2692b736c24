use std::path::Path;

use anyhow::{Context, Result};
use deploy_config::ComponentSpec;
use deploy_core::control::ControlPlane;
use indexmap::IndexMap;
use serde_json::Value;

use super::finish;
use crate::output::Format;

pub async fn install(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    finish(plane, plane.submit_install(name)?, format).await
}

pub async fn destroy(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    finish(plane, plane.submit_destroy(name)?, format).await
}

pub async fn reinstall(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    finish(plane, plane.submit_reinstall(name)?, format).await
}

pub async fn upgrade(
    plane: &ControlPlane,
    name: &str,
    component: &str,
    version: &str,
    format: Format,
) -> Result<()> {
    finish(plane, plane.submit_upgrade(name, component, version)?, format).await
}

/// Add the components described in `file` to an installed deployment
pub async fn add_component(plane: &ControlPlane, name: &str, file: &Path, format: Format) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let additions: IndexMap<String, ComponentSpec> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    finish(plane, plane.submit_component_change(name, additions)?, format).await
}

pub async fn del_component(plane: &ControlPlane, name: &str, component: &str, format: Format) -> Result<()> {
    finish(plane, plane.submit_del_component(name, component)?, format).await
}

fn report(verb: &str, result: &IndexMap<String, Value>) -> String {
    result
        .iter()
        .map(|(component, value)| {
            let servers = value
                .as_array()
                .map(Vec::len)
                .or_else(|| value.as_object().map(|o| o.len()))
                .unwrap_or(0);
            format!("✓ {component} {verb} on {servers} server(s)")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn start(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    let started = plane.start(name).await?;
    format.print(&started, |r| report("started", r))
}

pub async fn stop(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    let stopped = plane.stop(name).await?;
    format.print(&stopped, |r| report("stopped", r))
}
