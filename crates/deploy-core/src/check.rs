//! Check items, fix suggestions and the precheck board
//!
//! A precheck fills a [`CheckBoard`] from three sources: connectivity, static
//! parameter validation and runtime checks on the servers. The board merges
//! them in that fixed order when reporting.

use std::fmt;

use deploy_config::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::task::{TaskResult, TaskStatus};

/// Item name of the cross-component connectivity check
pub const SSH_ITEM: &str = "ssh";

/// Item name recorded when config generation fails
pub const GENERATE_ITEM: &str = "generate";

/// State of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Checked and fine
    Pass,
    /// Checked and failing
    Fail,
    /// Not checked yet
    Wait,
}

impl CheckStatus {
    /// Whether the check has run
    pub fn is_finished(self) -> bool {
        self != CheckStatus::Wait
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "pass"),
            CheckStatus::Fail => write!(f, "fail"),
            CheckStatus::Wait => write!(f, "wait"),
        }
    }
}

/// What a fix does to the deployment document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOp {
    /// Write a value
    Set,
    /// Remove the key
    Delete,
}

/// One concrete change proposed to resolve a failing check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixEval {
    /// Operation
    pub op: FixOp,
    /// Parameter key
    pub key: String,
    /// New value for `Set`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConfigValue>,
    /// Apply to the component's global settings instead of the server's
    pub is_global: bool,
    /// Safe to apply without asking
    pub auto_fix: bool,
}

impl FixEval {
    /// Set `key` to `value`
    pub fn set(key: impl Into<String>, value: ConfigValue, is_global: bool) -> Self {
        Self {
            op: FixOp::Set,
            key: key.into(),
            value: Some(value),
            is_global,
            auto_fix: true,
        }
    }

    /// Remove `key`
    pub fn delete(key: impl Into<String>, is_global: bool) -> Self {
        Self {
            op: FixOp::Delete,
            key: key.into(),
            value: None,
            is_global,
            auto_fix: true,
        }
    }

    /// Require confirmation before applying
    pub fn manual(mut self) -> Self {
        self.auto_fix = false;
        self
    }
}

/// Advice attached to a failing check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// What to do
    pub message: String,
    /// Whether recovery may apply the fixes on its own
    pub auto_fix: bool,
    /// Concrete changes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<FixEval>,
}

impl Suggestion {
    /// Advice that needs a human
    pub fn manual(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            auto_fix: false,
            fixes: Vec::new(),
        }
    }

    /// Advice recovery can apply; auto only if every fix is
    pub fn with_fixes(message: impl Into<String>, fixes: Vec<FixEval>) -> Self {
        Self {
            message: message.into(),
            auto_fix: !fixes.is_empty() && fixes.iter().all(|f| f.auto_fix),
            fixes,
        }
    }
}

/// Result of one check on one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckItem {
    /// Owning component; `None` for cross-component checks
    pub component: Option<String>,
    /// Server name
    pub server: String,
    /// Check name, e.g. `port` or `param:memory_limit`
    pub name: String,
    /// State
    pub status: CheckStatus,
    /// Error code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Advice, first one preferred
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

impl CheckItem {
    fn new(component: Option<&str>, server: &str, name: &str, status: CheckStatus) -> Self {
        Self {
            component: component.map(str::to_string),
            server: server.to_string(),
            name: name.to_string(),
            status,
            code: None,
            message: None,
            suggestions: Vec::new(),
        }
    }

    /// A passing check
    pub fn pass(component: Option<&str>, server: &str, name: &str) -> Self {
        Self::new(component, server, name, CheckStatus::Pass)
    }

    /// A check not run yet
    pub fn wait(component: Option<&str>, server: &str, name: &str) -> Self {
        Self::new(component, server, name, CheckStatus::Wait)
    }

    /// A failing check
    pub fn fail(
        component: Option<&str>,
        server: &str,
        name: &str,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut item = Self::new(component, server, name, CheckStatus::Fail);
        item.code = Some(code.into());
        item.message = Some(message.into());
        item
    }

    /// Attach a suggestion
    pub fn with_suggestion(mut self, suggestion: Suggestion) -> Self {
        self.suggestions.push(suggestion);
        self
    }

    /// Whether recovery can fix this on its own
    pub fn recoverable(&self) -> bool {
        self.status == CheckStatus::Fail && self.suggestions.first().is_some_and(|s| s.auto_fix)
    }

    fn key(&self) -> ItemKey {
        (self.component.clone(), self.server.clone(), self.name.clone())
    }
}

type ItemKey = (Option<String>, String, String);

/// Where an item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSource {
    /// Server connectivity
    Connect,
    /// Static parameter validation
    Param,
    /// Checks run on the servers
    Runtime,
}

/// Accumulated check results of one precheck run
#[derive(Debug, Clone, Default)]
pub struct CheckBoard {
    connect: IndexMap<ItemKey, CheckItem>,
    param: IndexMap<ItemKey, CheckItem>,
    runtime: IndexMap<ItemKey, CheckItem>,
    announced: IndexMap<ItemKey, CheckItem>,
    running: bool,
}

impl CheckBoard {
    /// An empty board for a run in progress
    pub fn new() -> Self {
        Self {
            running: true,
            ..Default::default()
        }
    }

    fn source_mut(&mut self, source: CheckSource) -> &mut IndexMap<ItemKey, CheckItem> {
        match source {
            CheckSource::Connect => &mut self.connect,
            CheckSource::Param => &mut self.param,
            CheckSource::Runtime => &mut self.runtime,
        }
    }

    /// Announce an item that a later phase will observe
    ///
    /// Announced items are listed as waiting but not counted until observed.
    pub fn announce(&mut self, component: &str, server: &str, name: &str) {
        let item = CheckItem::wait(Some(component), server, name);
        self.announced.insert(item.key(), item);
    }

    /// Record an observed item, replacing an earlier one with the same key
    pub fn record(&mut self, source: CheckSource, item: CheckItem) {
        self.source_mut(source).insert(item.key(), item);
    }

    /// Record several observed items
    pub fn record_all(&mut self, source: CheckSource, items: impl IntoIterator<Item = CheckItem>) {
        for item in items {
            self.record(source, item);
        }
    }

    /// Mark the run complete
    pub fn finish(&mut self) {
        self.running = false;
    }

    /// Whether the run is still going
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Observed items, connect first, then param, then runtime
    pub fn observed(&self) -> impl Iterator<Item = &CheckItem> {
        self.connect
            .values()
            .chain(self.param.values())
            .chain(self.runtime.values())
    }

    /// Failing items in report order
    pub fn failures(&self) -> impl Iterator<Item = &CheckItem> {
        self.observed().filter(|i| i.status == CheckStatus::Fail)
    }

    /// Whether every observed item passed and at least one was observed
    pub fn all_passed(&self) -> bool {
        let mut total = 0;
        for item in self.observed() {
            if item.status == CheckStatus::Fail {
                return false;
            }
            total += 1;
        }
        total > 0
    }

    /// Observed items plus announced ones not observed yet
    pub fn items(&self) -> Vec<CheckItem> {
        let mut items: Vec<CheckItem> = self.observed().cloned().collect();
        for (key, item) in &self.announced {
            let seen = self.param.contains_key(key) || self.runtime.contains_key(key);
            if !seen {
                items.push(item.clone());
            }
        }
        items
    }

    /// The report returned to clients
    pub fn view(&self) -> PrecheckResultView {
        let total = self.observed().count();
        let finished = self.observed().filter(|i| i.status.is_finished()).count();
        let all_passed = self.all_passed();

        let result = if self.running {
            TaskResult::Running
        } else if all_passed {
            TaskResult::Successful
        } else {
            TaskResult::Failed
        };

        PrecheckResultView {
            status: if self.running {
                TaskStatus::Running
            } else {
                TaskStatus::Finished
            },
            result,
            total,
            finished,
            all_passed,
            items: self.items().iter().map(CheckItemView::from).collect(),
        }
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let view = self.view();
        let failed = self.failures().count();
        if view.all_passed {
            format!("all {} checks passed", view.total)
        } else if view.total == 0 {
            "no checks were run".to_string()
        } else {
            format!("{failed} of {} checks failed", view.total)
        }
    }
}

/// Precheck result as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckResultView {
    /// Whether the precheck is still running
    pub status: TaskStatus,
    /// Outcome so far
    pub result: TaskResult,
    /// Observed items
    pub total: usize,
    /// Observed items that passed or failed
    pub finished: usize,
    /// Every observed item passed
    pub all_passed: bool,
    /// Items in report order
    pub items: Vec<CheckItemView>,
}

/// One item in a [`PrecheckResultView`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckItemView {
    /// Owning component
    pub component: Option<String>,
    /// Server name
    pub server: String,
    /// Check name
    pub name: String,
    /// State
    pub status: CheckStatus,
    /// Error code
    pub code: Option<String>,
    /// Error message
    pub message: Option<String>,
    /// Recovery can fix this on its own
    pub recoverable: bool,
    /// First suggestion's message
    pub suggestion: Option<String>,
}

impl From<&CheckItem> for CheckItemView {
    fn from(item: &CheckItem) -> Self {
        Self {
            component: item.component.clone(),
            server: item.server.clone(),
            name: item.name.clone(),
            status: item.status,
            code: item.code.clone(),
            message: item.message.clone(),
            recoverable: item.recoverable(),
            suggestion: item.suggestions.first().map(|s| s.message.clone()),
        }
    }
}
