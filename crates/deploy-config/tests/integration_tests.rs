//! Integration tests for deploy-config

use deploy_config::{
    ConfigError, ConfigValue, DeploymentStatus, DeploymentStore, GeneratedConfig, Server, parser,
    reconcile_and_commit,
};
use tempfile::TempDir;

const DOCUMENT: &str = r#"
user:
  username: admin
  key_file: /home/admin/.ssh/id_rsa
  port: 2022

oceanbase-ce:
  version: 4.2.1
  servers:
    - 10.0.0.1
    - name: server2
      ip: 10.0.0.2
    - 10.0.0.3
  global:
    home_path: /home/admin/oceanbase
    memory_limit: 8G
    mysql_port: 2881
  10.0.0.1:
    zone: zone1
  server2:
    zone: zone2

obproxy-ce:
  depends: [oceanbase-ce]
  servers: [10.0.0.4]
  global:
    home_path: /home/admin/obproxy
    listen_port: 2883
"#;

#[test]
fn test_full_document_parsing() {
    let spec = parser::parse_str(DOCUMENT).unwrap();

    assert_eq!(spec.user.username, "admin");
    assert_eq!(spec.user.port, 2022);
    assert_eq!(spec.user.timeout, 30);
    assert!(spec.user.password.is_none());

    let names: Vec<_> = spec.components.keys().cloned().collect();
    assert_eq!(names, vec!["oceanbase-ce", "obproxy-ce"]);

    let db = spec.component("oceanbase-ce").unwrap();
    assert_eq!(db.version.as_deref(), Some("4.2.1"));
    assert_eq!(db.servers[1], Server::named("server2", "10.0.0.2"));
    assert_eq!(db.servers[2], Server::new("10.0.0.3"));
    assert_eq!(
        db.get("server2", "zone"),
        Some(&ConfigValue::String("zone2".to_string()))
    );
    assert_eq!(db.get("10.0.0.3", "zone"), None);
    assert_eq!(
        db.get("10.0.0.3", "memory_limit"),
        Some(&ConfigValue::String("8G".to_string()))
    );

    let proxy = spec.component("obproxy-ce").unwrap();
    assert_eq!(proxy.depends, vec!["oceanbase-ce"]);
    assert_eq!(
        spec.dependency_order().unwrap(),
        vec!["oceanbase-ce", "obproxy-ce"]
    );
    assert_eq!(spec.dependents_of("oceanbase-ce"), vec!["obproxy-ce"]);
}

#[test]
fn test_document_round_trips_through_yaml() {
    let spec = parser::parse_str(DOCUMENT).unwrap();
    let yaml = parser::to_yaml(&spec).unwrap();
    let reparsed = parser::parse_str(&yaml).unwrap();
    assert_eq!(spec, reparsed);
}

#[test]
fn test_invalid_documents() {
    assert!(matches!(
        parser::parse_str("user:\n  username: root\n"),
        Err(ConfigError::ValidationError(_))
    ));

    let no_servers = "db:\n  version: '1.0'\n";
    assert!(matches!(
        parser::parse_str(no_servers),
        Err(ConfigError::ValidationError(_))
    ));

    let cycle = "a:\n  depends: [b]\n  servers: [10.0.0.1]\nb:\n  depends: [a]\n  servers: [10.0.0.1]\n";
    assert!(matches!(
        parser::parse_str(cycle),
        Err(ConfigError::DependencyCycle(_))
    ));
}

#[test]
fn test_store_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = DeploymentStore::new(dir.path());
    let spec = parser::parse_str(DOCUMENT).unwrap();

    store.create("prod", spec.clone()).unwrap();
    store.create("staging", spec).unwrap();
    assert_eq!(store.list().unwrap(), vec!["prod", "staging"]);

    // Generated config is committed through the reconciliation callback
    let mut generated = GeneratedConfig::default();
    for server in ["10.0.0.1", "server2", "10.0.0.3"] {
        generated.servers.insert(
            server.to_string(),
            [("cpu_count".to_string(), ConfigValue::from(16))]
                .into_iter()
                .collect(),
        );
    }
    reconcile_and_commit(generated, |config| {
        store.update("prod", |deployment| {
            deployment
                .generated
                .insert("oceanbase-ce".to_string(), config.clone());
            deployment.transition(DeploymentStatus::Deploying)
        })
    })
    .unwrap();

    let loaded = store.load("prod").unwrap();
    assert_eq!(loaded.status, DeploymentStatus::Deploying);
    let db = loaded.component_config("oceanbase-ce").unwrap();
    assert_eq!(db.global.get("cpu_count"), Some(&ConfigValue::from(16)));
    assert!(db.servers.is_empty());
    assert_eq!(
        loaded.resolved("oceanbase-ce", "server2", "zone"),
        Some(ConfigValue::String("zone2".to_string()))
    );

    store.remove("staging").unwrap();
    assert_eq!(store.list().unwrap(), vec!["prod"]);
    assert!(matches!(
        store.remove("staging"),
        Err(ConfigError::DeploymentNotFound(_))
    ));
}

#[test]
fn test_destroyed_deployment_can_be_reconfigured() {
    let dir = TempDir::new().unwrap();
    let store = DeploymentStore::new(dir.path());
    let spec = parser::parse_str(DOCUMENT).unwrap();

    store.create("prod", spec.clone()).unwrap();
    store
        .update("prod", |d| {
            d.transition(DeploymentStatus::Destroying)?;
            d.transition(DeploymentStatus::Destroyed)
        })
        .unwrap();

    let again = store.create("prod", spec).unwrap();
    assert_eq!(again.status, DeploymentStatus::Configured);
}
