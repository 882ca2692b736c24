use anyhow::Result;
use deploy_core::control::ControlPlane;

use crate::output::{self, Format};

pub fn run(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    format.print(&plane.status(name)?, output::summary_table)
}

pub fn list(plane: &ControlPlane, format: Format) -> Result<()> {
    let deployments = plane.list()?;
    format.print(deployments.as_slice(), output::list_table)
}

pub async fn display(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    let components = plane.display(name).await?;
    format.print(&components, output::display_table)
}
