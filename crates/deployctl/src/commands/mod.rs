pub mod config;
pub mod lifecycle;
pub mod precheck;
pub mod status;

use std::time::Duration;

use anyhow::{Result, bail};
use deploy_core::control::ControlPlane;
use deploy_core::task::{TaskHandle, TaskKind, TaskSnapshot, TaskStatus};

use crate::output::{self, Format};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Follow a submitted task until it finishes, reporting step changes
pub async fn follow(plane: &ControlPlane, handle: TaskHandle) -> Result<TaskSnapshot> {
    let (name, kind) = (handle.subject.clone(), handle.kind);
    let mut reported = 0;

    loop {
        let view = plane.task_status(&name, kind)?;
        for step in view.steps.iter().skip(reported) {
            eprintln!("  {kind}: {}", step.name);
        }
        reported = view.steps.len();
        if view.status == TaskStatus::Finished {
            break;
        }
        smol::Timer::after(POLL_INTERVAL).await;
    }

    Ok(handle.wait().await?)
}

/// Follow a task, print its step table and fail if the task failed
pub async fn finish(plane: &ControlPlane, handle: TaskHandle, format: Format) -> Result<()> {
    let kind: TaskKind = handle.kind;
    let name = handle.subject.clone();
    let snapshot = follow(plane, handle).await?;

    format.print(&snapshot.view(), output::task_table)?;
    if !snapshot.succeeded() {
        bail!(
            "{kind} of '{name}' failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
