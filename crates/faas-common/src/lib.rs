// Shared types, errors and collaborator interfaces for the FaaS control plane.

use std::fmt::Display;

pub use serde::{Deserialize, Serialize};
pub use serde_json;
use thiserror::Error;

mod traits;
mod types;

pub use traits::{EnvStore, ProjectBackend, ProjectRegistry, RuntimeProvisioner};
pub use types::*;

#[derive(Error, Debug)]
pub enum FaasError {
    /// Rejected before any filesystem mutation.
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Dependency Install Error for project {project}: {reason}")]
    DependencyInstall { project: String, reason: String },

    #[error("Backend Unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Execution Error: {0}")]
    Execution(String),

    /// The control plane was built without a collaborator it cannot run without.
    #[error("Uninitialized State: {0}")]
    Uninitialized(String),

    #[error("Deployment failed during {step}: {source}")]
    Deployment {
        step: DeployStep,
        #[source]
        source: std::io::Error,
    },

    /// Env vars are merged after the code is committed and are not rolled back.
    #[error("Environment update failed for project {project}: {reason}")]
    EnvUpdate { project: String, reason: String },

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FaasError {
    /// Tags an I/O failure with the deployment step it happened in.
    /// Meant for `map_err(FaasError::at(DeployStep::Write))`.
    pub fn at(step: DeployStep) -> impl FnOnce(std::io::Error) -> FaasError {
        move |source| FaasError::Deployment { step, source }
    }

    /// The step a deployment failed in, if this error came out of one.
    pub fn deploy_step(&self) -> Option<DeployStep> {
        match self {
            FaasError::Validation(_) => Some(DeployStep::Validate),
            FaasError::DependencyInstall { .. } => Some(DeployStep::Provision),
            FaasError::Deployment { step, .. } => Some(*step),
            FaasError::EnvUpdate { .. } => Some(DeployStep::Commit),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FaasError>;

/// Steps of a deployment transaction, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    Validate,
    Backup,
    Write,
    Manifest,
    Provision,
    Rollback,
    Commit,
}

impl Display for DeployStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeployStep::Validate => "validate",
            DeployStep::Backup => "backup",
            DeployStep::Write => "write",
            DeployStep::Manifest => "manifest",
            DeployStep::Provision => "provision",
            DeployStep::Rollback => "rollback",
            DeployStep::Commit => "commit",
        };
        f.write_str(name)
    }
}
