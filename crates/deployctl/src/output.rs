//! Rendering results as tables or JSON

use anyhow::Result;
use clap::ValueEnum;
use comfy_table::{Cell, Color, Table};
use deploy_config::{ConfigValue, DeploymentStatus};
use deploy_core::check::{CheckStatus, PrecheckResultView};
use deploy_core::control::DeploymentSummary;
use deploy_core::recover::RecoveryReport;
use deploy_core::task::{TaskResult, TaskStatusView};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

impl Format {
    /// Print `value` as pretty JSON, or hand it to `table`
    pub fn print<T: Serialize + ?Sized>(self, value: &T, table: impl FnOnce(&T) -> String) -> Result<()> {
        match self {
            Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Format::Table => println!("{}", table(value)),
        }
        Ok(())
    }
}

fn check_color(status: CheckStatus) -> Color {
    match status {
        CheckStatus::Pass => Color::Green,
        CheckStatus::Fail => Color::Red,
        CheckStatus::Wait => Color::Yellow,
    }
}

fn result_color(result: TaskResult) -> Color {
    match result {
        TaskResult::Successful => Color::Green,
        TaskResult::Failed => Color::Red,
        TaskResult::Running => Color::Yellow,
    }
}

fn status_color(status: DeploymentStatus) -> Color {
    match status {
        DeploymentStatus::Running => Color::Green,
        DeploymentStatus::Configured | DeploymentStatus::Deployed => Color::Cyan,
        DeploymentStatus::Stopped | DeploymentStatus::Destroyed => Color::DarkGrey,
        _ => Color::Yellow,
    }
}

fn config_value(value: Option<&ConfigValue>) -> String {
    match value {
        None | Some(ConfigValue::Null) => "-".to_string(),
        Some(ConfigValue::String(s)) => s.clone(),
        Some(ConfigValue::Bool(b)) => b.to_string(),
        Some(ConfigValue::Number(n)) => n.to_string(),
        Some(other) => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

pub fn precheck_table(view: &PrecheckResultView) -> String {
    let mut table = Table::new();
    table.set_header(vec!["COMPONENT", "SERVER", "CHECK", "STATUS", "CODE", "DETAIL"]);

    for item in &view.items {
        let detail = match (&item.message, &item.suggestion) {
            (Some(message), Some(suggestion)) => format!("{message}\n-> {suggestion}"),
            (Some(message), None) => message.clone(),
            (None, _) => String::new(),
        };
        let status = if item.recoverable {
            format!("{} (auto)", item.status)
        } else {
            item.status.to_string()
        };
        table.add_row(vec![
            Cell::new(item.component.as_deref().unwrap_or("-")),
            Cell::new(&item.server),
            Cell::new(&item.name),
            Cell::new(status).fg(check_color(item.status)),
            Cell::new(item.code.as_deref().unwrap_or("")),
            Cell::new(detail),
        ]);
    }

    let verdict = if view.all_passed {
        "all checks passed".to_string()
    } else {
        let failed = view.items.iter().filter(|i| i.status == CheckStatus::Fail).count();
        let recoverable = view.items.iter().filter(|i| i.recoverable).count();
        format!("{failed} failed, {recoverable} fixable with `deployctl recover`")
    };
    format!("{table}\n{}/{} checks finished: {verdict}", view.finished, view.total)
}

pub fn task_table(view: &TaskStatusView) -> String {
    let mut table = Table::new();
    table.set_header(vec!["STEP", "STATUS", "RESULT"]);
    for step in &view.steps {
        table.add_row(vec![
            Cell::new(&step.name),
            Cell::new(step.status.to_string()),
            Cell::new(step.result.to_string()).fg(result_color(step.result)),
        ]);
    }

    let mut out = table.to_string();
    out.push_str(&format!(
        "\n{} ({}/{} steps)",
        view.result, view.finished, view.total
    ));
    if let Some(message) = &view.message {
        out.push_str(&format!(": {message}"));
    }
    out
}

pub fn summary_table(summary: &DeploymentSummary) -> String {
    let mut out = format!("Deployment: {}\nStatus: {}", summary.name, summary.status);
    if summary.upgrading {
        out.push_str(" (upgrading)");
    }

    let mut components = Table::new();
    components.set_header(vec!["COMPONENT", "VERSION", "SERVERS", "DEPENDS"]);
    for component in &summary.components {
        components.add_row(vec![
            Cell::new(&component.name),
            Cell::new(component.version.as_deref().unwrap_or("-")),
            Cell::new(component.servers.join(", ")),
            Cell::new(component.depends.join(", ")),
        ]);
    }
    out.push_str(&format!("\n{components}"));

    if !summary.tasks.is_empty() {
        let mut tasks = Table::new();
        tasks.set_header(vec!["TASK", "STATUS", "RESULT", "MESSAGE"]);
        for (kind, view) in &summary.tasks {
            tasks.add_row(vec![
                Cell::new(kind),
                Cell::new(view.status.to_string()),
                Cell::new(view.result.to_string()).fg(result_color(view.result)),
                Cell::new(view.message.as_deref().unwrap_or("")),
            ]);
        }
        out.push_str(&format!("\n{tasks}"));
    }
    out
}

pub fn list_table(deployments: &[(String, DeploymentStatus)]) -> String {
    if deployments.is_empty() {
        return "No deployments".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["DEPLOYMENT", "STATUS"]);
    for (name, status) in deployments {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(status.to_string()).fg(status_color(*status)),
        ]);
    }
    table.to_string()
}

/// Per-component, per-server process status from `display`
pub fn display_table(components: &IndexMap<String, Value>) -> String {
    let mut table = Table::new();
    table.set_header(vec!["COMPONENT", "SERVER", "PID", "RUNNING", "LISTENING"]);

    for (component, servers) in components {
        let Some(servers) = servers.as_object() else {
            continue;
        };
        for (server, status) in servers {
            if let Some(error) = status.get("error").and_then(Value::as_str) {
                table.add_row(vec![
                    Cell::new(component),
                    Cell::new(server),
                    Cell::new("-"),
                    Cell::new(format!("error: {error}")).fg(Color::Red),
                    Cell::new(""),
                ]);
                continue;
            }

            let running = status.get("running").and_then(Value::as_bool).unwrap_or(false);
            let pid = status
                .get("pid")
                .and_then(Value::as_u64)
                .map_or_else(|| "-".to_string(), |p| p.to_string());
            let listening = status
                .get("listening")
                .and_then(Value::as_array)
                .map(|ports| {
                    ports
                        .iter()
                        .filter_map(Value::as_u64)
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();

            table.add_row(vec![
                Cell::new(component),
                Cell::new(server),
                Cell::new(pid),
                Cell::new(if running { "yes" } else { "no" })
                    .fg(if running { Color::Green } else { Color::Red }),
                Cell::new(listening),
            ]);
        }
    }
    table.to_string()
}

pub fn recovery_table(report: &RecoveryReport) -> String {
    if report.applied.is_empty() && report.skipped.is_empty() {
        return "Nothing to recover".to_string();
    }

    let mut table = Table::new();
    table.set_header(vec!["COMPONENT", "SERVER", "KEY", "OLD", "NEW"]);
    for fix in &report.applied {
        table.add_row(vec![
            Cell::new(&fix.component),
            Cell::new(&fix.server),
            Cell::new(&fix.key),
            Cell::new(config_value(fix.old.as_ref())),
            Cell::new(config_value(fix.new.as_ref())).fg(Color::Green),
        ]);
    }

    let mut out = table.to_string();
    for skipped in &report.skipped {
        out.push_str(&format!(
            "\nskipped {} on {}: {}",
            skipped.key, skipped.server, skipped.reason
        ));
    }
    if !report.regenerated.is_empty() {
        out.push_str(&format!("\nregenerated: {}", report.regenerated.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::recover::{FixAudit, SkippedFix};
    use serde_json::json;

    #[test]
    fn test_display_table_lists_every_server() {
        let mut components = IndexMap::new();
        components.insert(
            "observer".to_string(),
            json!({
                "10.0.0.1": { "pid": 4242, "running": true, "listening": [2881, 2882] },
                "10.0.0.2": { "error": "Cannot reach 10.0.0.2: timed out" },
            }),
        );

        let rendered = display_table(&components);
        assert!(rendered.contains("4242"));
        assert!(rendered.contains("2881, 2882"));
        assert!(rendered.contains("error: Cannot reach 10.0.0.2"));
    }

    #[test]
    fn test_recovery_table() {
        let empty = RecoveryReport::default();
        assert_eq!(recovery_table(&empty), "Nothing to recover");

        let report = RecoveryReport {
            applied: vec![FixAudit {
                component: "observer".to_string(),
                server: "10.0.0.1".to_string(),
                key: "memory_limit".to_string(),
                old: Some(ConfigValue::from("8G")),
                new: Some(ConfigValue::from("4G")),
            }],
            skipped: vec![SkippedFix {
                component: Some("proxy".to_string()),
                server: "10.0.0.9".to_string(),
                key: "port".to_string(),
                reason: "server '10.0.0.9' not found in 'proxy'".to_string(),
            }],
            regenerated: vec!["observer".to_string()],
        };

        let rendered = recovery_table(&report);
        assert!(rendered.contains("8G"));
        assert!(rendered.contains("4G"));
        assert!(rendered.contains("skipped port on 10.0.0.9"));
        assert!(rendered.contains("regenerated: observer"));
    }

    #[test]
    fn test_list_table_empty() {
        assert_eq!(list_table(&[]), "No deployments");
    }
}
