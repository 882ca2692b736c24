//! Background task lifecycle
//!
//! Long operations run as tasks identified by `(subject, kind)`, where the
//! subject is a deployment name. At most one unfinished task may exist per
//! pair: a second submission is rejected, not queued. The body runs on the
//! injected [`Spawner`] and its outcome, including a panic, is captured on the
//! task record instead of reaching the runtime.
//!
//! Locking: one index lock maps subjects to their task tables and each
//! subject's table has its own lock. Neither is held across an await.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::Receiver;
use async_runtime_compat::Spawner;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{Error, Result};

/// Kind of long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Install a configured deployment
    Install,
    /// Tear a deployment down
    Destroy,
    /// Validate a deployment against its servers
    Precheck,
    /// Upgrade one component
    Upgrade,
    /// Stop and start every component again
    Reinstall,
    /// Add components to a running deployment
    ComponentChange,
    /// Remove one component
    DelComponent,
}

impl TaskKind {
    /// All kinds, in display order
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Precheck,
        TaskKind::Install,
        TaskKind::Upgrade,
        TaskKind::Reinstall,
        TaskKind::ComponentChange,
        TaskKind::DelComponent,
        TaskKind::Destroy,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Install => "install",
            TaskKind::Destroy => "destroy",
            TaskKind::Precheck => "precheck",
            TaskKind::Upgrade => "upgrade",
            TaskKind::Reinstall => "reinstall",
            TaskKind::ComponentChange => "component_change",
            TaskKind::DelComponent => "del_component",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.replace('-', "_");
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| Error::invalid_state(format!("unknown task kind '{s}'")))
    }
}

/// Scheduling status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, body not yet started
    Pending,
    /// Body executing
    Running,
    /// Body completed, successfully or not
    Finished,
}

/// Outcome so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    /// No outcome yet
    Running,
    /// Completed without error
    Successful,
    /// Returned an error or panicked
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Finished => write!(f, "finished"),
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::Running => write!(f, "running"),
            TaskResult::Successful => write!(f, "successful"),
            TaskResult::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one named step inside a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Step name
    pub name: String,
    /// Whether the step has completed
    pub status: TaskStatus,
    /// Its outcome
    pub result: TaskResult,
}

/// Point-in-time copy of a task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Unique id
    pub id: Uuid,
    /// Deployment name
    pub subject: String,
    /// Operation kind
    pub kind: TaskKind,
    /// Scheduling status
    pub status: TaskStatus,
    /// Outcome
    pub result: TaskResult,
    /// When the task was submitted
    pub started_at: DateTime<Utc>,
    /// When the body completed
    pub finished_at: Option<DateTime<Utc>>,
    /// Captured error or panic message
    pub error: Option<String>,
    /// Latest progress message
    pub message: Option<String>,
    /// Named steps in the order they began
    pub steps: Vec<StepProgress>,
}

impl TaskSnapshot {
    fn new(subject: &str, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            kind,
            status: TaskStatus::Pending,
            result: TaskResult::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            message: None,
            steps: Vec::new(),
        }
    }

    /// Whether the body has completed
    pub fn is_finished(&self) -> bool {
        self.status == TaskStatus::Finished
    }

    /// Whether the body completed without error
    pub fn succeeded(&self) -> bool {
        self.result == TaskResult::Successful
    }

    /// The shape reported to clients
    pub fn view(&self) -> TaskStatusView {
        let finished = self
            .steps
            .iter()
            .filter(|s| s.status == TaskStatus::Finished)
            .count();
        let current = self
            .steps
            .iter()
            .rev()
            .find(|s| s.status == TaskStatus::Running)
            .or_else(|| self.steps.last())
            .map(|s| s.name.clone());

        TaskStatusView {
            id: self.id,
            status: self.status,
            result: self.result,
            total: self.steps.len(),
            finished,
            current,
            message: self.error.clone().or_else(|| self.message.clone()),
            steps: self.steps.clone(),
        }
    }
}

/// Task status as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    /// Task id
    pub id: Uuid,
    /// Scheduling status
    pub status: TaskStatus,
    /// Outcome
    pub result: TaskResult,
    /// Number of steps begun
    pub total: usize,
    /// Number of steps completed
    pub finished: usize,
    /// Step in progress, or the last one
    pub current: Option<String>,
    /// Error if the task failed, otherwise the latest message
    pub message: Option<String>,
    /// Every step
    pub steps: Vec<StepProgress>,
}

type SubjectTasks = Arc<Mutex<HashMap<TaskKind, TaskSnapshot>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle a task body uses to report progress
#[derive(Clone)]
pub struct TaskContext {
    tasks: SubjectTasks,
    subject: String,
    kind: TaskKind,
    id: Uuid,
}

impl TaskContext {
    /// Task id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deployment name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Task kind
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    fn update(&self, f: impl FnOnce(&mut TaskSnapshot)) {
        let mut tasks = lock(&self.tasks);
        // The record may have been replaced after this task finished
        if let Some(task) = tasks.get_mut(&self.kind).filter(|t| t.id == self.id) {
            f(task);
        }
    }

    /// Record that a named step has started
    pub fn begin_step(&self, name: &str) {
        debug!(subject = %self.subject, kind = %self.kind, step = name, "step started");
        self.update(|task| {
            task.steps.push(StepProgress {
                name: name.to_string(),
                status: TaskStatus::Running,
                result: TaskResult::Running,
            });
        });
    }

    /// Record the outcome of the most recent step with this name
    pub fn finish_step(&self, name: &str, success: bool) {
        self.update(|task| {
            if let Some(step) = task.steps.iter_mut().rev().find(|s| s.name == name) {
                step.status = TaskStatus::Finished;
                step.result = if success {
                    TaskResult::Successful
                } else {
                    TaskResult::Failed
                };
            }
        });
    }

    /// Run `fut` as a named step
    pub async fn step<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.begin_step(name);
        let result = fut.await;
        self.finish_step(name, result.is_ok());
        result
    }

    /// Set the progress message
    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|task| task.message = Some(message));
    }

    fn mark_running(&self) {
        self.update(|task| task.status = TaskStatus::Running);
    }

    fn finish(&self, outcome: std::result::Result<(), String>) -> Option<TaskSnapshot> {
        let mut finished = None;
        self.update(|task| {
            task.status = TaskStatus::Finished;
            task.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => task.result = TaskResult::Successful,
                Err(message) => {
                    task.result = TaskResult::Failed;
                    task.error = Some(message);
                }
            }
            finished = Some(task.clone());
        });
        finished
    }
}

/// Waits for a submitted task to finish
#[derive(Debug)]
pub struct TaskHandle {
    /// Task id
    pub id: Uuid,
    /// Deployment name
    pub subject: String,
    /// Task kind
    pub kind: TaskKind,
    done: Receiver<TaskSnapshot>,
}

impl TaskHandle {
    /// Wait for the body to complete and return the final record
    pub async fn wait(self) -> Result<TaskSnapshot> {
        self.done.recv().await.map_err(|_| {
            Error::invalid_state(format!(
                "{} task for '{}' was dropped before finishing",
                self.kind, self.subject
            ))
        })
    }
}

/// In-memory registry of tasks
pub struct TaskRegistry {
    spawner: Arc<dyn Spawner>,
    subjects: Mutex<HashMap<String, SubjectTasks>>,
}

impl TaskRegistry {
    /// Create a registry that runs bodies on `spawner`
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            subjects: Mutex::new(HashMap::new()),
        }
    }

    fn subject(&self, subject: &str) -> SubjectTasks {
        lock(&self.subjects)
            .entry(subject.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, subject: &str) -> Option<SubjectTasks> {
        lock(&self.subjects).get(subject).cloned()
    }

    /// Start `body` in the background as the `(subject, kind)` task
    ///
    /// Fails with [`Error::TaskConflict`] when a task for the same pair has
    /// not finished yet.
    pub fn submit<F, Fut>(&self, subject: &str, kind: TaskKind, body: F) -> Result<TaskHandle>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let tasks = self.subject(subject);
        let id = {
            let mut table = lock(&tasks);
            if table.get(&kind).is_some_and(|t| !t.is_finished()) {
                return Err(Error::task_conflict(subject, kind, "is already running"));
            }
            let snapshot = TaskSnapshot::new(subject, kind);
            let id = snapshot.id;
            table.insert(kind, snapshot);
            id
        };

        let ctx = TaskContext {
            tasks,
            subject: subject.to_string(),
            kind,
            id,
        };
        let (tx, rx) = async_channel::bounded(1);

        info!(subject = %subject, kind = %kind, task_id = %id, "task submitted");

        self.spawner.spawn(Box::pin(async move {
            ctx.mark_running();

            let body_ctx = ctx.clone();
            let outcome = AssertUnwindSafe(async move { body(body_ctx).await })
                .catch_unwind()
                .await;

            let outcome = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("task panicked: {}", panic_message(panic.as_ref()))),
            };

            match &outcome {
                Ok(()) => info!(subject = %ctx.subject, kind = %ctx.kind, "task finished"),
                Err(message) => error!(subject = %ctx.subject, kind = %ctx.kind, error = %message, "task failed"),
            }

            if let Some(snapshot) = ctx.finish(outcome) {
                let _ = tx.send(snapshot).await;
            }
        }));

        Ok(TaskHandle {
            id,
            subject: subject.to_string(),
            kind,
            done: rx,
        })
    }

    /// Snapshot of the `(subject, kind)` task
    pub fn get(&self, subject: &str, kind: TaskKind) -> Option<TaskSnapshot> {
        let tasks = self.existing(subject)?;
        let table = lock(&tasks);
        table.get(&kind).cloned()
    }

    /// Every task recorded for a subject
    pub fn list(&self, subject: &str) -> Vec<TaskSnapshot> {
        let Some(tasks) = self.existing(subject) else {
            return Vec::new();
        };
        let table = lock(&tasks);
        TaskKind::ALL
            .iter()
            .filter_map(|kind| table.get(kind).cloned())
            .collect()
    }

    /// Whether the `(subject, kind)` task exists and has not finished
    pub fn is_active(&self, subject: &str, kind: TaskKind) -> bool {
        self.get(subject, kind).is_some_and(|t| !t.is_finished())
    }

    /// Remove a finished task record
    ///
    /// Returns `false` when there is nothing to clear. Clearing a task that
    /// has not finished is a [`Error::TaskConflict`].
    pub fn clear(&self, subject: &str, kind: TaskKind) -> Result<bool> {
        let Some(tasks) = self.existing(subject) else {
            return Ok(false);
        };
        let mut table = lock(&tasks);
        match table.get(&kind) {
            None => Ok(false),
            Some(task) if !task.is_finished() => {
                Err(Error::task_conflict(subject, kind, "has not finished"))
            }
            Some(_) => {
                table.remove(&kind);
                debug!(subject = %subject, kind = %kind, "task cleared");
                Ok(true)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
