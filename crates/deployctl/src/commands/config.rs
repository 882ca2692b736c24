use std::path::Path;

use anyhow::{Context, Result};
use deploy_config::parser;
use deploy_core::control::ControlPlane;

use crate::output::{self, Format};

pub fn run(plane: &ControlPlane, name: &str, file: &Path, format: Format) -> Result<()> {
    let spec = parser::parse_file(file)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let deployment = plane
        .configure(name, spec)
        .with_context(|| format!("Failed to configure '{name}'"))?;
    eprintln!(
        "✓ Deployment '{}' configured with {} component(s)",
        deployment.name,
        deployment.spec.components.len()
    );

    format.print(&plane.status(name)?, output::summary_table)
}
