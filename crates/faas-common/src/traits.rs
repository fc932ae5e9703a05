use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Handle to a running execution backend for one project.
#[async_trait]
pub trait ProjectBackend: Send + Sync {
    async fn execute_function(&self, project: &str, function: &str, payload: Value)
        -> Result<Value>;

    /// Project-scoped entry point used by direct dispatch.
    async fn execute_function_async(&self, function: &str, payload: Value) -> Result<Value>;
}

/// Resolves a project name to its running backend.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    /// `None` when the project is unknown or its backend is not started.
    async fn get_project(&self, name: &str) -> Option<Arc<dyn ProjectBackend>>;
}

/// Per-project isolated dependency environments.
#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    /// Creates the project's environment if it does not exist yet.
    async fn ensure_environment(&self, project: &str) -> Result<()>;

    async fn install_manifest(&self, project: &str, manifest_path: &Path) -> Result<()>;
}

/// Project-scoped environment variable storage.
#[async_trait]
pub trait EnvStore: Send + Sync {
    /// Merges `vars` into the project's existing variables.
    async fn update_project_env(&self, project: &str, vars: &HashMap<String, String>)
        -> Result<()>;

    async fn get_project_env(&self, project: &str) -> Result<HashMap<String, String>>;
}
