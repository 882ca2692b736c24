use anyhow::{Result, bail};
use deploy_core::check::{CheckStatus, PrecheckResultView};
use deploy_core::control::ControlPlane;
use tracing::warn;

use super::follow;
use crate::output::{self, Format};

async fn check(plane: &ControlPlane, name: &str) -> Result<PrecheckResultView> {
    let handle = plane.submit_precheck(name)?;
    let snapshot = follow(plane, handle).await?;
    settle(name, snapshot.error, plane.precheck_result(name))
}

/// Tell a precheck that stopped at a failed phase from one that never ran
fn settle(
    name: &str,
    error: Option<String>,
    view: deploy_core::Result<PrecheckResultView>,
) -> Result<PrecheckResultView> {
    match (error, view) {
        (None, view) => Ok(view?),
        // A phase failed: the failing items explain why
        (Some(error), Ok(view)) if view.items.iter().any(|i| i.status == CheckStatus::Fail) => {
            warn!(deployment = name, %error, "precheck stopped before runtime checks");
            Ok(view)
        }
        (Some(error), _) => bail!("precheck of '{name}' could not run: {error}"),
    }
}

pub async fn run(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    let view = check(plane, name).await?;
    format.print(&view, output::precheck_table)?;
    if !view.all_passed {
        bail!("precheck of '{name}' found problems");
    }
    Ok(())
}

/// Precheck, apply automatic fixes, then check again
pub async fn recover(plane: &ControlPlane, name: &str, format: Format) -> Result<()> {
    let view = check(plane, name).await?;
    if view.all_passed {
        eprintln!("✓ All checks passed, nothing to recover");
        return Ok(());
    }

    let report = plane.recover(name).await?;
    format.print(&report, output::recovery_table)?;

    let view = check(plane, name).await?;
    format.print(&view, output::precheck_table)?;
    if !view.all_passed {
        bail!("'{name}' still has problems that need manual fixes");
    }
    Ok(())
}
