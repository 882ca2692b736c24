//! Control plane operations against simulated hosts

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_runtime_compat::smol::SmolSpawner;
use async_trait::async_trait;
use command_executor::{ExitResult, Shell};
use deploy_config::{
    ComponentSpec, ConfigValue, DeploymentSpec, DeploymentStatus, ParamDef, ParamKind, ParamSchema, Server,
    UserConfig,
};
use deploy_core::check::{CheckStatus, PrecheckResultView};
use deploy_core::connector::Connector;
use deploy_core::control::{ControlPlane, ControlPlaneConfig};
use deploy_core::plugin::{ComponentProfile, PluginRegistry};
use deploy_core::task::{TaskKind, TaskResult, TaskSnapshot, TaskStatus};
use deploy_core::{Error, Result};
use indexmap::IndexMap;
use process_coordinator::CoordinatorPolicy;
use process_coordinator::testing::FakeHost;
use tempfile::TempDir;

const HOSTS: [&str; 2] = ["10.0.0.1", "10.0.0.2"];

struct FakeConnector {
    hosts: HashMap<String, Arc<FakeHost>>,
    gate: Option<async_channel::Receiver<()>>,
    connects: AtomicUsize,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &Server, _user: &UserConfig) -> Result<Arc<dyn Shell>> {
        if let Some(gate) = &self.gate {
            let _ = gate.recv().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.hosts.get(&server.ip) {
            Some(host) if !host.state().unreachable => Ok(host.clone() as Arc<dyn Shell>),
            _ => Err(Error::connectivity(&server.ip, "connection refused")),
        }
    }
}

struct Cluster {
    plane: ControlPlane,
    hosts: HashMap<String, Arc<FakeHost>>,
    connector: Arc<FakeConnector>,
    _home: TempDir,
}

impl Cluster {
    fn host(&self, ip: &str) -> &Arc<FakeHost> {
        &self.hosts[ip]
    }

    fn launch_ports(&self, ports: &[u16]) {
        for host in self.hosts.values() {
            host.state().launch_ports = ports.to_vec();
        }
    }

    fn status(&self) -> DeploymentStatus {
        self.plane.status("prod").unwrap().status
    }
}

fn profiles() -> IndexMap<String, ComponentProfile> {
    let mut profiles = IndexMap::new();
    profiles.insert(
        "observer".to_string(),
        ComponentProfile {
            command: Some("bin/observer -p ${port}".to_string()),
            memory_key: Some("memory_limit".to_string()),
            params: ParamSchema::new()
                .with("home_path", ParamDef::new(ParamKind::Path).with_default("/home/admin/observer"))
                .with("port", ParamDef::new(ParamKind::Port).with_default(2881))
                .with("memory_limit", ParamDef::new(ParamKind::Capacity))
                .with("legacy_mode", ParamDef::new(ParamKind::Bool).deprecated()),
            ..ComponentProfile::default()
        },
    );
    profiles.insert(
        "proxy".to_string(),
        ComponentProfile {
            command: Some("bin/proxy -p ${port}".to_string()),
            requires: vec!["observer".to_string()],
            params: ParamSchema::new()
                .with("home_path", ParamDef::new(ParamKind::Path).with_default("/home/admin/proxy"))
                .with("port", ParamDef::new(ParamKind::Port).with_default(2883)),
            ..ComponentProfile::default()
        },
    );
    profiles
}

fn cluster_with(gate: Option<async_channel::Receiver<()>>) -> Cluster {
    let hosts: HashMap<String, Arc<FakeHost>> = HOSTS
        .iter()
        .map(|ip| (ip.to_string(), Arc::new(FakeHost::new(*ip))))
        .collect();
    let connector = Arc::new(FakeConnector {
        hosts: hosts.clone(),
        gate,
        connects: AtomicUsize::new(0),
    });

    let home = TempDir::new().unwrap();
    let config = ControlPlaneConfig::new(home.path()).with_coordinator(CoordinatorPolicy::immediate());
    let plane = ControlPlane::builder(config)
        .with_spawner(Arc::new(SmolSpawner))
        .with_connector(connector.clone())
        .with_plugins(PluginRegistry::from_profiles(&profiles()).unwrap())
        .build()
        .unwrap();

    Cluster {
        plane,
        hosts,
        connector,
        _home: home,
    }
}

fn cluster() -> Cluster {
    cluster_with(None)
}

fn spec(yaml: &str) -> DeploymentSpec {
    serde_yaml::from_str(yaml).unwrap()
}

fn observer_only() -> DeploymentSpec {
    spec(
        r#"
user:
  username: admin
observer:
  servers: [10.0.0.1, 10.0.0.2]
"#,
    )
}

fn observer_and_proxy() -> DeploymentSpec {
    spec(
        r#"
user:
  username: admin
observer:
  servers: [10.0.0.1, 10.0.0.2]
proxy:
  depends: [observer]
  servers: [10.0.0.1]
"#,
    )
}

async fn install(cluster: &Cluster, deployment: DeploymentSpec, ports: &[u16]) {
    cluster.plane.configure("prod", deployment).unwrap();
    cluster.launch_ports(ports);
    let snapshot = cluster.plane.submit_install("prod").unwrap().wait().await.unwrap();
    assert!(snapshot.succeeded(), "install failed: {:?}", snapshot.error);
}

async fn precheck(cluster: &Cluster) -> PrecheckResultView {
    let snapshot = cluster.plane.submit_precheck("prod").unwrap().wait().await.unwrap();
    assert!(snapshot.succeeded(), "precheck task failed: {:?}", snapshot.error);
    cluster.plane.precheck_result("prod").unwrap()
}

/// Run a precheck that is expected to stop at a failed phase
async fn halted_precheck(cluster: &Cluster) -> (TaskSnapshot, PrecheckResultView) {
    let snapshot = cluster.plane.submit_precheck("prod").unwrap().wait().await.unwrap();
    assert_eq!(snapshot.result, TaskResult::Failed);
    (snapshot, cluster.plane.precheck_result("prod").unwrap())
}

fn step_result(snapshot: &TaskSnapshot, name: &str) -> Option<TaskResult> {
    snapshot.steps.iter().find(|s| s.name == name).map(|s| s.result)
}

#[smol_potat::test]
async fn test_precheck_generates_and_stores_config() {
    let cluster = cluster();
    cluster.plane.configure("prod", observer_only()).unwrap();

    let result = precheck(&cluster).await;
    assert!(result.all_passed);
    assert!(result.items.iter().any(|i| i.name == "ssh"));

    let deployment = cluster.plane.store().load("prod").unwrap();
    let observer = &deployment.generated["observer"];
    assert_eq!(observer.get("10.0.0.2", "port"), Some(&ConfigValue::from(2881)));

    let view = cluster.plane.task_status("prod", TaskKind::Precheck).unwrap();
    assert_eq!(view.result, TaskResult::Successful);
    assert_eq!(view.message.as_deref(), Some(format!("all {} checks passed", result.total).as_str()));
}

#[smol_potat::test]
async fn test_unreachable_server_ends_precheck_before_generation() {
    let cluster = cluster();
    cluster.host("10.0.0.2").state().unreachable = true;
    cluster.plane.configure("prod", observer_only()).unwrap();

    let (snapshot, result) = halted_precheck(&cluster).await;

    assert!(snapshot.error.as_ref().unwrap().contains("Cannot reach 10.0.0.2"));
    assert_eq!(step_result(&snapshot, "connect"), Some(TaskResult::Failed));
    assert_eq!(step_result(&snapshot, "generate"), None);

    assert!(!result.all_passed);
    assert_eq!(result.total, result.items.iter().filter(|i| i.name == "ssh").count());
    assert_eq!(result.total, 2);
    let ssh = result
        .items
        .iter()
        .find(|i| i.name == "ssh" && i.server == "10.0.0.2")
        .unwrap();
    assert_eq!(ssh.status, CheckStatus::Fail);
    assert_eq!(ssh.code.as_deref(), Some("SSH_CONNECT_FAILED"));
    assert!(!result.items.iter().any(|i| i.name.starts_with("param:")));
    assert!(cluster.plane.store().load("prod").unwrap().generated.is_empty());
}

#[smol_potat::test]
async fn test_shared_host_is_connected_once() {
    let cluster = cluster();
    cluster
        .plane
        .configure(
            "prod",
            spec(
                r#"
observer:
  servers:
    - name: obs1
      ip: 10.0.0.1
    - 10.0.0.2
proxy:
  depends: [observer]
  servers:
    - name: proxy1
      ip: 10.0.0.1
"#,
            ),
        )
        .unwrap();

    let result = precheck(&cluster).await;

    assert!(result.all_passed);
    let mut ssh: Vec<&str> = result
        .items
        .iter()
        .filter(|i| i.name == "ssh")
        .map(|i| i.server.as_str())
        .collect();
    ssh.sort();
    assert_eq!(ssh, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(cluster.connector.connects.load(Ordering::SeqCst), 2);
}

#[smol_potat::test]
async fn test_precheck_adds_required_component() {
    let cluster = cluster();
    cluster
        .plane
        .configure(
            "prod",
            spec(
                r#"
proxy:
  servers: [10.0.0.1]
"#,
            ),
        )
        .unwrap();

    let result = precheck(&cluster).await;
    assert!(result.all_passed);

    let deployment = cluster.plane.store().load("prod").unwrap();
    assert_eq!(deployment.spec.dependency_order().unwrap(), vec!["observer", "proxy"]);
    assert_eq!(deployment.spec.components["proxy"].depends, vec!["observer"]);
    assert!(deployment.generated.contains_key("observer"));
}

#[smol_potat::test]
async fn test_active_precheck_blocks_duplicates_and_recovery() {
    let (open, gate) = async_channel::bounded::<()>(1);
    let cluster = cluster_with(Some(gate));
    cluster.plane.configure("prod", observer_only()).unwrap();

    let handle = cluster.plane.submit_precheck("prod").unwrap();

    let duplicate = cluster.plane.submit_precheck("prod").unwrap_err();
    assert!(matches!(duplicate, Error::TaskConflict(_)));
    let recover = cluster.plane.recover("prod").await.unwrap_err();
    assert!(matches!(recover, Error::TaskConflict(_)));
    assert_ne!(
        cluster.plane.task_status("prod", TaskKind::Precheck).unwrap().status,
        TaskStatus::Finished
    );

    open.close();
    assert!(handle.wait().await.unwrap().succeeded());
    cluster.plane.clear_task("prod", TaskKind::Precheck).unwrap();
    assert!(cluster.plane.task_status("prod", TaskKind::Precheck).is_err());
}

#[smol_potat::test]
async fn test_recover_without_precheck() {
    let cluster = cluster();
    cluster.plane.configure("prod", observer_only()).unwrap();

    let err = cluster.plane.recover("prod").await.unwrap_err();
    assert!(matches!(err, Error::Recovery(_)));
}

#[smol_potat::test]
async fn test_recovery_cycle_until_precheck_passes() {
    let cluster = cluster();
    for host in cluster.hosts.values() {
        host.respond("MemAvailable", ExitResult::ok("MemAvailable:    4194304 kB\n"));
    }
    cluster
        .plane
        .configure(
            "prod",
            spec(
                r#"
observer:
  servers: [10.0.0.1, 10.0.0.2]
  global:
    memory_limit: 8G
    legacy_mode: true
"#,
            ),
        )
        .unwrap();

    // Deprecated parameter stops the run before runtime checks
    let (snapshot, result) = halted_precheck(&cluster).await;
    assert!(snapshot.error.as_ref().unwrap().contains("config generation failed"));
    assert_eq!(step_result(&snapshot, "generate"), Some(TaskResult::Failed));
    assert_eq!(step_result(&snapshot, "validate"), None);
    assert!(!result.all_passed);
    assert!(!result.items.iter().any(|i| i.name == "memory" && i.status != CheckStatus::Wait));

    let report = cluster.plane.recover("prod").await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].key, "legacy_mode");
    assert_eq!(report.regenerated, vec!["observer"]);
    let stored = cluster.plane.store().load("prod").unwrap();
    assert!(!stored.spec.components["observer"].global.contains_key("legacy_mode"));

    // Now memory is checked and found short on both servers
    let result = precheck(&cluster).await;
    assert!(!result.all_passed);
    let short: Vec<_> = result
        .items
        .iter()
        .filter(|i| i.code.as_deref() == Some("MEMORY_INSUFFICIENT"))
        .collect();
    assert_eq!(short.len(), 2);
    assert!(short.iter().all(|i| i.recoverable));

    let report = cluster.plane.recover("prod").await.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert!(report.skipped.is_empty());
    let stored = cluster.plane.store().load("prod").unwrap();
    let observer = &stored.spec.components["observer"];
    assert_eq!(observer.get("10.0.0.1", "memory_limit"), Some(&ConfigValue::from("4G")));
    assert_eq!(
        stored.generated["observer"].get("10.0.0.2", "memory_limit"),
        Some(&ConfigValue::from("4G"))
    );

    assert!(precheck(&cluster).await.all_passed);
}

#[smol_potat::test]
async fn test_install_starts_dependencies_first() {
    let cluster = cluster();
    install(&cluster, observer_and_proxy(), &[2881, 2883]).await;

    assert_eq!(cluster.status(), DeploymentStatus::Running);

    let scripts = cluster.host("10.0.0.1").state().scripts.clone();
    let launches: Vec<&String> = scripts.iter().filter(|s| s.contains("nohup ")).collect();
    assert_eq!(launches.len(), 2);
    assert!(launches[0].contains("bin/observer -p 2881"));
    assert!(launches[1].contains("bin/proxy -p 2883"));
    assert_eq!(cluster.host("10.0.0.2").count("nohup "), 1);

    let summary = cluster.plane.status("prod").unwrap();
    assert!(summary.steps["observer"]["start"].success);
    assert!(summary.steps["proxy"]["start"].success);

    let view = cluster.plane.task_status("prod", TaskKind::Install).unwrap();
    assert_eq!(view.steps.first().map(|s| s.name.as_str()), Some("precheck"));
}

#[smol_potat::test]
async fn test_failed_install_returns_to_configured() {
    let cluster = cluster();
    cluster.plane.configure("prod", observer_only()).unwrap();
    cluster.host("10.0.0.2").state().launch_fails = true;

    let snapshot = cluster.plane.submit_install("prod").unwrap().wait().await.unwrap();

    assert_eq!(snapshot.result, TaskResult::Failed);
    assert!(snapshot.error.as_ref().unwrap().contains("10.0.0.2"));
    assert_eq!(cluster.status(), DeploymentStatus::Configured);
}

#[smol_potat::test]
async fn test_install_refuses_failed_precheck() {
    let cluster = cluster();
    cluster.plane.configure("prod", observer_only()).unwrap();
    cluster.host("10.0.0.1").spawn("squatter", &[2881]);

    let snapshot = cluster.plane.submit_install("prod").unwrap().wait().await.unwrap();

    assert_eq!(snapshot.result, TaskResult::Failed);
    assert!(snapshot.error.as_ref().unwrap().contains("precheck failed"));
    assert_eq!(cluster.host("10.0.0.1").count("nohup "), 0);
    let result = cluster.plane.precheck_result("prod").unwrap();
    assert!(result.items.iter().any(|i| i.code.as_deref() == Some("PORT_IN_USE")));
}

#[smol_potat::test]
async fn test_stop_and_start() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881, 2883]).await;

    let stopped = cluster.plane.stop("prod").await.unwrap();
    assert!(stopped.contains_key("observer"));
    assert_eq!(cluster.status(), DeploymentStatus::Stopped);
    assert_eq!(cluster.host("10.0.0.1").count("kill -9"), 1);

    cluster.plane.start("prod").await.unwrap();
    assert_eq!(cluster.status(), DeploymentStatus::Running);
    assert_eq!(cluster.host("10.0.0.1").count("nohup "), 2);

    let display = cluster.plane.display("prod").await.unwrap();
    assert_eq!(display["observer"]["10.0.0.1"]["running"], serde_json::json!(true));
}

#[smol_potat::test]
async fn test_stop_tolerates_port_not_released() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881]).await;
    for host in cluster.hosts.values() {
        host.state().ignore_kill = true;
    }

    let stopped = cluster.plane.stop("prod").await.unwrap();

    assert_eq!(cluster.status(), DeploymentStatus::Stopped);
    for server in HOSTS {
        let held = &stopped["observer"][server]["port_not_released"];
        assert_eq!(held["ports"], serde_json::json!([2881]));
    }
}

#[smol_potat::test]
async fn test_destroy_removes_everything() {
    let cluster = cluster();
    install(&cluster, observer_and_proxy(), &[2881, 2883]).await;

    let snapshot = cluster.plane.submit_destroy("prod").unwrap().wait().await.unwrap();
    assert!(snapshot.succeeded(), "destroy failed: {:?}", snapshot.error);

    assert_eq!(cluster.status(), DeploymentStatus::Destroyed);
    assert_eq!(cluster.host("10.0.0.1").count("rm -rf"), 2);
    assert_eq!(cluster.host("10.0.0.2").count("rm -rf"), 1);
    assert!(cluster.plane.status("prod").unwrap().steps.is_empty());
    assert!(cluster.plane.precheck_result("prod").is_err());

    // A destroyed deployment can be configured again
    cluster.plane.configure("prod", observer_only()).unwrap();
    assert_eq!(cluster.status(), DeploymentStatus::Configured);
}

#[smol_potat::test]
async fn test_destroy_of_configured_deployment_touches_nothing() {
    let cluster = cluster();
    cluster.plane.configure("prod", observer_only()).unwrap();

    let snapshot = cluster.plane.submit_destroy("prod").unwrap().wait().await.unwrap();

    assert!(snapshot.succeeded());
    assert_eq!(cluster.connector.connects.load(Ordering::SeqCst), 0);
    assert_eq!(cluster.status(), DeploymentStatus::Destroyed);
}

#[smol_potat::test]
async fn test_configure_after_install_is_rejected() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881, 2883]).await;

    let err = cluster.plane.configure("prod", observer_and_proxy()).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[smol_potat::test]
async fn test_del_component() {
    let cluster = cluster();
    install(&cluster, observer_and_proxy(), &[2881, 2883]).await;

    let err = cluster.plane.submit_del_component("prod", "observer").unwrap_err();
    assert!(err.to_string().contains("required by proxy"));

    let snapshot = cluster
        .plane
        .submit_del_component("prod", "proxy")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(snapshot.succeeded(), "del-component failed: {:?}", snapshot.error);

    let deployment = cluster.plane.store().load("prod").unwrap();
    assert!(!deployment.spec.components.contains_key("proxy"));
    assert!(!deployment.generated.contains_key("proxy"));
    assert!(!cluster.plane.status("prod").unwrap().steps.contains_key("proxy"));
}

#[smol_potat::test]
async fn test_upgrade_restarts_component_with_new_version() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881, 2883]).await;

    let snapshot = cluster
        .plane
        .submit_upgrade("prod", "observer", "4.2.1")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(snapshot.succeeded(), "upgrade failed: {:?}", snapshot.error);

    let summary = cluster.plane.status("prod").unwrap();
    assert!(!summary.upgrading);
    assert_eq!(summary.status, DeploymentStatus::Running);
    assert_eq!(summary.components[0].version.as_deref(), Some("4.2.1"));
    assert_eq!(cluster.host("10.0.0.2").count("kill -9"), 1);
    assert_eq!(cluster.host("10.0.0.2").count("nohup "), 2);
}

#[smol_potat::test]
async fn test_component_change_adds_and_starts_new_component() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881]).await;
    cluster.launch_ports(&[2883]);

    let mut additions = IndexMap::new();
    additions.insert(
        "proxy".to_string(),
        ComponentSpec::with_servers(vec![Server::new("10.0.0.2")]),
    );
    let snapshot = cluster
        .plane
        .submit_component_change("prod", additions)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(snapshot.succeeded(), "component change failed: {:?}", snapshot.error);

    let deployment = cluster.plane.store().load("prod").unwrap();
    assert_eq!(deployment.spec.components["proxy"].depends, vec!["observer"]);
    assert!(deployment.generated.contains_key("proxy"));
    assert_eq!(cluster.host("10.0.0.2").count("bin/proxy -p 2883"), 1);
    // Already-running components are not restarted
    assert_eq!(cluster.host("10.0.0.2").count("bin/observer"), 1);
}

#[smol_potat::test]
async fn test_component_change_rolls_back_on_failed_precheck() {
    let cluster = cluster();
    install(&cluster, observer_only(), &[2881, 2883]).await;

    // The running observer already listens on 2883
    let mut additions = IndexMap::new();
    additions.insert(
        "proxy".to_string(),
        ComponentSpec::with_servers(vec![Server::new("10.0.0.1")]),
    );
    let snapshot = cluster
        .plane
        .submit_component_change("prod", additions)
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(snapshot.result, TaskResult::Failed);
    let deployment = cluster.plane.store().load("prod").unwrap();
    assert!(!deployment.spec.components.contains_key("proxy"));
    assert!(!deployment.generated.contains_key("proxy"));
    assert_eq!(cluster.status(), DeploymentStatus::Running);
}
