//! End-to-end runs of the `deployctl` binary
//!
//! Only commands that never reach a server are exercised here.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const DEPLOYMENT: &str = r#"
user:
  username: admin
observer:
  version: 4.2.0
  servers:
    - name: server1
      ip: 10.0.0.1
    - name: server2
      ip: 10.0.0.2
  global:
    home_path: /home/admin/observer
proxy:
  depends: [observer]
  servers: [10.0.0.3]
"#;

struct CliTestContext {
    dir: TempDir,
}

impl CliTestContext {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deployctl.yaml"), "log_level: warn\n").unwrap();
        Self { dir }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_deployctl"))
            .arg("--settings")
            .arg(self.dir.path().join("deployctl.yaml"))
            .arg("--home")
            .arg(self.home())
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> Value {
        let mut full = vec!["--format", "json"];
        full.extend_from_slice(args);
        let output = self.run(&full);
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_config_then_status() {
    let ctx = CliTestContext::new();
    let file = ctx.write("prod.yaml", DEPLOYMENT);

    let summary = ctx.json(&["config", "prod", "-c", path_str(&file)]);
    assert_eq!(summary["status"], "configured");
    assert_eq!(summary["components"][0]["name"], "observer");
    assert_eq!(summary["components"][0]["servers"][1], "server2");
    assert_eq!(summary["components"][1]["depends"][0], "observer");

    assert!(ctx.home().join("cluster/prod/config.yaml").is_file());

    let output = ctx.run(&["status", "prod"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status: configured"));
    assert!(stdout.contains("4.2.0"));
}

#[test]
fn test_status_lists_deployments() {
    let ctx = CliTestContext::new();

    let output = ctx.run(&["status"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No deployments"));

    let file = ctx.write("prod.yaml", DEPLOYMENT);
    ctx.run(&["config", "prod", "-c", path_str(&file)]);
    ctx.run(&["config", "staging", "-c", path_str(&file)]);

    let list = ctx.json(&["status"]);
    assert_eq!(list, serde_json::json!([["prod", "configured"], ["staging", "configured"]]));
}

#[test]
fn test_destroy_of_configured_deployment() {
    let ctx = CliTestContext::new();
    let file = ctx.write("prod.yaml", DEPLOYMENT);
    ctx.run(&["config", "prod", "-c", path_str(&file)]);

    let view = ctx.json(&["destroy", "prod"]);
    assert_eq!(view["result"], "successful");

    let summary = ctx.json(&["status", "prod"]);
    assert_eq!(summary["status"], "destroyed");
}

#[test]
fn test_invalid_document_is_rejected() {
    let ctx = CliTestContext::new();
    let file = ctx.write(
        "broken.yaml",
        r#"
observer:
  depends: [proxy]
  servers: [10.0.0.1]
proxy:
  depends: [observer]
  servers: [10.0.0.3]
"#,
    );

    let output = ctx.run(&["config", "prod", "-c", path_str(&file)]);
    assert!(!output.status.success());
    assert!(!ctx.home().join("cluster/prod").exists());
}

#[test]
fn test_operations_on_unknown_deployment_fail() {
    let ctx = CliTestContext::new();

    for args in [["status", "ghost"], ["install", "ghost"], ["precheck", "ghost"]] {
        let output = ctx.run(&args);
        assert!(!output.status.success(), "{args:?} should fail");
        assert!(String::from_utf8_lossy(&output.stderr).contains("ghost"));
    }
}

#[test]
fn test_install_requires_configured_state() {
    let ctx = CliTestContext::new();
    let file = ctx.write("prod.yaml", DEPLOYMENT);
    ctx.run(&["config", "prod", "-c", path_str(&file)]);
    ctx.run(&["destroy", "prod"]);

    let output = ctx.run(&["install", "prod"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("destroyed"));
}
