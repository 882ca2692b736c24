//! Per-component step records
//!
//! Each `(deployment, component)` pair has a namespace mapping a step name to
//! the last value the step returned. A successful record makes the step
//! idempotent until the namespace is cleared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one step run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Whether the step succeeded
    pub success: bool,
    /// Value returned, or the error message on failure
    pub value: Value,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    /// A successful record
    pub fn success(value: Value) -> Self {
        Self {
            success: true,
            value,
            recorded_at: Utc::now(),
        }
    }

    /// A failed record carrying the error message
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: Value::String(message.into()),
            recorded_at: Utc::now(),
        }
    }
}

/// Step records of one deployment, by component then step
pub type NamespaceSnapshot = IndexMap<String, IndexMap<String, StepRecord>>;

type SubjectNamespace = Arc<Mutex<NamespaceSnapshot>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory namespace store
#[derive(Default)]
pub struct NamespaceStore {
    subjects: Mutex<HashMap<String, SubjectNamespace>>,
}

impl NamespaceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn subject(&self, subject: &str) -> SubjectNamespace {
        lock(&self.subjects)
            .entry(subject.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, subject: &str) -> Option<SubjectNamespace> {
        lock(&self.subjects).get(subject).cloned()
    }

    /// Record the outcome of a step, replacing any earlier record
    pub fn record(&self, subject: &str, component: &str, step: &str, record: StepRecord) {
        let namespace = self.subject(subject);
        lock(&namespace)
            .entry(component.to_string())
            .or_default()
            .insert(step.to_string(), record);
    }

    /// The last record of a step
    pub fn get(&self, subject: &str, component: &str, step: &str) -> Option<StepRecord> {
        let namespace = self.existing(subject)?;
        let records = lock(&namespace);
        records.get(component)?.get(step).cloned()
    }

    /// Whether the step last completed successfully
    pub fn is_completed(&self, subject: &str, component: &str, step: &str) -> bool {
        self.get(subject, component, step).is_some_and(|r| r.success)
    }

    /// Every record of a deployment
    pub fn snapshot(&self, subject: &str) -> NamespaceSnapshot {
        self.existing(subject)
            .map(|namespace| lock(&namespace).clone())
            .unwrap_or_default()
    }

    /// Forget every record of a deployment
    pub fn clear(&self, subject: &str) {
        if let Some(namespace) = self.existing(subject) {
            lock(&namespace).clear();
        }
    }

    /// Forget the records of one component
    pub fn clear_component(&self, subject: &str, component: &str) {
        if let Some(namespace) = self.existing(subject) {
            lock(&namespace).shift_remove(component);
        }
    }

    /// Forget one step
    pub fn clear_step(&self, subject: &str, component: &str, step: &str) {
        if let Some(namespace) = self.existing(subject) {
            if let Some(records) = lock(&namespace).get_mut(component) {
                records.shift_remove(step);
            }
        }
    }
}
