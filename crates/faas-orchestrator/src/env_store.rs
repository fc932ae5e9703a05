//! Project-scoped environment variable stores.

use crate::fsutil::write_atomic;
use crate::keyed_lock::KeyedLocks;
use crate::validate::validate_name;
use async_trait::async_trait;
use dashmap::DashMap;
use faas_common::{EnvStore, FaasError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default)]
pub struct InMemoryEnvStore {
    projects: DashMap<String, HashMap<String, String>>,
}

impl InMemoryEnvStore {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl EnvStore for InMemoryEnvStore {
    async fn update_project_env(
        &self,
        project: &str,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        self.projects
            .entry(project.to_string())
            .or_default()
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get_project_env(&self, project: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .projects
            .get(project)
            .map(|vars| vars.clone())
            .unwrap_or_default())
    }
}

/// One `<project>.json` object per project. Merges hold a per-project lock
/// so concurrent updates cannot drop each other's keys.
#[derive(Debug)]
pub struct FileEnvStore {
    dir: PathBuf,
    locks: KeyedLocks<String>,
}

impl FileEnvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Project names become file names, so anything that could leave `dir`
    /// is refused.
    fn path(&self, project: &str) -> Result<PathBuf> {
        validate_name("project", project)?;
        Ok(self.dir.join(format!("{}.json", project)))
    }

    async fn read(&self, project: &str) -> Result<HashMap<String, String>> {
        match tokio::fs::read(self.path(project)?).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                FaasError::Internal(format!("Corrupt env file for project {}: {}", project, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EnvStore for FileEnvStore {
    async fn update_project_env(
        &self,
        project: &str,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        let path = self.path(project)?;
        let _guard = self.locks.lock(project.to_string()).await;

        let mut current = self.read(project).await?;
        current.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        let bytes = serde_json::to_vec_pretty(&current)
            .map_err(|e| FaasError::Internal(format!("Failed to encode env vars: {}", e)))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&path, &bytes).await?;
        debug!(%project, keys = vars.len(), "Merged project environment variables");
        Ok(())
    }

    async fn get_project_env(&self, project: &str) -> Result<HashMap<String, String>> {
        self.read(project).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_in_memory_merge() {
        let store = InMemoryEnvStore::new();
        store
            .update_project_env("p", &vars(&[("A", "1"), ("B", "2")]))
            .await
            .unwrap();
        store
            .update_project_env("p", &vars(&[("B", "3")]))
            .await
            .unwrap();
        assert_eq!(
            store.get_project_env("p").await.unwrap(),
            vars(&[("A", "1"), ("B", "3")])
        );
        assert!(store.get_project_env("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_and_merges() {
        let dir = TempDir::new().unwrap();
        let store = FileEnvStore::new(dir.path().join("envs"));
        assert!(store.get_project_env("p").await.unwrap().is_empty());

        store
            .update_project_env("p", &vars(&[("TOKEN", "abc")]))
            .await
            .unwrap();
        store
            .update_project_env("p", &vars(&[("REGION", "eu")]))
            .await
            .unwrap();

        let reopened = FileEnvStore::new(dir.path().join("envs"));
        assert_eq!(
            reopened.get_project_env("p").await.unwrap(),
            vars(&[("TOKEN", "abc"), ("REGION", "eu")])
        );
    }

    #[tokio::test]
    async fn test_file_store_concurrent_updates_keep_all_keys() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileEnvStore::new(dir.path()));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let key = format!("K{}", i);
                    store
                        .update_project_env("p", &vars(&[(key.as_str(), "v")]))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.get_project_env("p").await.unwrap().len(), 16);
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_file_store_refuses_names_outside_its_dir() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("secret.json"), r#"{"DB_PASSWORD":"hunter2"}"#).unwrap();
        let store = FileEnvStore::new(root.path().join("envs"));

        for name in ["../secret", "a/b", ".hidden", ""] {
            assert!(matches!(
                store.get_project_env(name).await,
                Err(FaasError::Validation(_))
            ));
            assert!(matches!(
                store.update_project_env(name, &vars(&[("K", "v")])).await,
                Err(FaasError::Validation(_))
            ));
        }
        assert!(!root.path().join("envs").exists());
    }
}
