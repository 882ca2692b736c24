//! File-backed deployment persistence
//!
//! Layout under the control plane home:
//!
//! ```text
//! <home>/cluster/<name>/config.yaml     user document
//! <home>/cluster/<name>/generated.yaml  generated per-component config
//! <home>/cluster/<name>/.data           status and timestamps
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::deployment::{ComponentConfig, Deployment, DeploymentStatus};
use crate::parser;
use crate::spec::DeploymentSpec;
use crate::{ConfigError, Result};

const SPEC_FILE: &str = "config.yaml";
const GENERATED_FILE: &str = "generated.yaml";
const META_FILE: &str = ".data";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    status: DeploymentStatus,
    #[serde(default)]
    upgrading: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Stores deployments as YAML files, one directory per deployment
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    root: PathBuf,
}

impl DeploymentStore {
    /// A store rooted at `<home>/cluster`
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            root: home.as_ref().join("cluster"),
        }
    }

    /// Directory holding every deployment
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one deployment
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a deployment is stored
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).join(META_FILE).is_file()
    }

    /// Store a new deployment document
    ///
    /// The deployment is first written as `Configuring` and moved to
    /// `Configured` once the document is on disk. A destroyed deployment of
    /// the same name is replaced.
    pub fn create(&self, name: &str, spec: DeploymentSpec) -> Result<Deployment> {
        if self.exists(name) {
            let existing = self.load(name)?;
            if existing.status != DeploymentStatus::Destroyed {
                return Err(ConfigError::DeploymentExists(name.to_string()));
            }
            debug!(deployment = %name, "replacing destroyed deployment");
        }

        let mut deployment = Deployment::new(name, spec);
        self.save(&mut deployment)?;
        deployment.transition(DeploymentStatus::Configured)?;
        self.save(&mut deployment)?;

        info!(deployment = %name, components = deployment.spec.components.len(), "deployment configured");
        Ok(deployment)
    }

    /// Load a stored deployment
    pub fn load(&self, name: &str) -> Result<Deployment> {
        let dir = self.path(name);
        let meta_path = dir.join(META_FILE);
        if !meta_path.is_file() {
            return Err(ConfigError::DeploymentNotFound(name.to_string()));
        }

        let meta: Meta = serde_yaml::from_str(&fs::read_to_string(&meta_path)?)?;
        let spec: DeploymentSpec = serde_yaml::from_str(&fs::read_to_string(dir.join(SPEC_FILE))?)?;

        let generated_path = dir.join(GENERATED_FILE);
        let generated: IndexMap<String, ComponentConfig> = if generated_path.is_file() {
            serde_yaml::from_str(&fs::read_to_string(&generated_path)?)?
        } else {
            IndexMap::new()
        };

        Ok(Deployment {
            name: name.to_string(),
            status: meta.status,
            upgrading: meta.upgrading,
            spec,
            generated,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    /// Write a deployment, refreshing its `updated_at`
    pub fn save(&self, deployment: &mut Deployment) -> Result<()> {
        let dir = self.path(&deployment.name);
        fs::create_dir_all(&dir)?;

        deployment.updated_at = Utc::now();

        write_atomic(&dir.join(SPEC_FILE), &parser::to_yaml(&deployment.spec)?)?;
        write_atomic(
            &dir.join(GENERATED_FILE),
            &serde_yaml::to_string(&deployment.generated)?,
        )?;

        let meta = Meta {
            status: deployment.status,
            upgrading: deployment.upgrading,
            created_at: deployment.created_at,
            updated_at: deployment.updated_at,
        };
        write_atomic(&dir.join(META_FILE), &serde_yaml::to_string(&meta)?)?;

        debug!(deployment = %deployment.name, status = %deployment.status, "deployment saved");
        Ok(())
    }

    /// Load, modify and save a deployment in one step
    pub fn update<T>(&self, name: &str, f: impl FnOnce(&mut Deployment) -> Result<T>) -> Result<T> {
        let mut deployment = self.load(name)?;
        let out = f(&mut deployment)?;
        self.save(&mut deployment)?;
        Ok(out)
    }

    /// Names of every stored deployment, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(META_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a stored deployment
    pub fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Err(ConfigError::DeploymentNotFound(name.to_string()));
        }
        fs::remove_dir_all(self.path(name))?;
        info!(deployment = %name, "deployment removed from store");
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ComponentSpec, Server};
    use tempfile::TempDir;

    fn spec() -> DeploymentSpec {
        let mut spec = DeploymentSpec::default();
        spec.components.insert(
            "db".to_string(),
            ComponentSpec::with_servers(vec![Server::new("10.0.0.1")]),
        );
        spec
    }

    #[test]
    fn test_create_and_load() {
        let dir = TempDir::new().unwrap();
        let store = DeploymentStore::new(dir.path());

        let created = store.create("d1", spec()).unwrap();
        assert_eq!(created.status, DeploymentStatus::Configured);

        let loaded = store.load("d1").unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Configured);
        assert_eq!(loaded.spec, created.spec);
        assert!(dir.path().join("cluster/d1/config.yaml").is_file());
        assert!(dir.path().join("cluster/d1/.data").is_file());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DeploymentStore::new(dir.path());
        store.create("d1", spec()).unwrap();
        assert!(matches!(
            store.create("d1", spec()),
            Err(ConfigError::DeploymentExists(_))
        ));
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = DeploymentStore::new(dir.path());
        assert!(matches!(
            store.load("nope"),
            Err(ConfigError::DeploymentNotFound(_))
        ));
        assert!(store.list().unwrap().is_empty());
    }
}
