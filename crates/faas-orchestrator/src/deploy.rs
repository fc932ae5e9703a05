//! Rollback-safe deployment of function code and project dependencies.
//!
//! On-disk layout, per project:
//!
//! ```text
//! <projects_dir>/<project>/<function>.py
//! <projects_dir>/<project>/<function>.py.bak   (only while a deployment runs)
//! <projects_dir>/<project>/requirements.txt
//! ```

use crate::fsutil::{remove_if_exists, write_atomic};
use crate::keyed_lock::KeyedLocks;
use crate::validate::{validate_function_code, validate_name};
use faas_common::{
    DeployReceipt, DeployStep, DeploymentRequest, EnvStore, FaasError, Result, RuntimeProvisioner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub const MANIFEST_FILE: &str = "requirements.txt";
pub const CODE_EXTENSION: &str = "py";
const BACKUP_SUFFIX: &str = ".bak";

/// What the manifest looked like before this deployment replaced it.
enum PreviousManifest {
    Absent,
    Content(Vec<u8>),
}

pub struct DeploymentManager {
    projects_dir: PathBuf,
    provisioner: Arc<dyn RuntimeProvisioner>,
    env_store: Arc<dyn EnvStore>,
    /// Serializes deployments and deletions of one `(project, function)`.
    target_locks: KeyedLocks<(String, String)>,
    /// Serializes manifest writes and installs within one project.
    manifest_locks: KeyedLocks<String>,
}

impl DeploymentManager {
    pub fn new(
        projects_dir: impl Into<PathBuf>,
        provisioner: Arc<dyn RuntimeProvisioner>,
        env_store: Arc<dyn EnvStore>,
    ) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            provisioner,
            env_store,
            target_locks: KeyedLocks::new(),
            manifest_locks: KeyedLocks::new(),
        }
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.projects_dir.join(project)
    }

    pub fn code_path(&self, project: &str, function: &str) -> PathBuf {
        self.project_dir(project)
            .join(format!("{}.{}", function, CODE_EXTENSION))
    }

    pub fn manifest_path(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(MANIFEST_FILE)
    }

    fn backup_path(code_path: &Path) -> PathBuf {
        let mut path = code_path.as_os_str().to_owned();
        path.push(BACKUP_SUFFIX);
        PathBuf::from(path)
    }

    /// Validates, backs up, writes, provisions and commits one function.
    ///
    /// Either the new code (and manifest, if supplied) is in place with its
    /// dependencies installed, or the previous code and manifest are restored
    /// and the error says which step failed. Validation failures touch nothing.
    #[instrument(skip(self, project, request), fields(project = %project, function = %request.function))]
    pub async fn deploy(&self, project: &str, request: DeploymentRequest) -> Result<DeployReceipt> {
        let function = request.function.as_str();
        info!("Starting function deployment");

        validate_name("project", project)?;
        validate_name("function", function)?;
        validate_function_code(&request.code)?;

        let _target = self
            .target_locks
            .lock((project.to_string(), function.to_string()))
            .await;

        let code_path = self.code_path(project, function);
        let backup_path = Self::backup_path(&code_path);

        tokio::fs::create_dir_all(self.project_dir(project))
            .await
            .map_err(FaasError::at(DeployStep::Write))?;

        let had_code = tokio::fs::try_exists(&code_path)
            .await
            .map_err(FaasError::at(DeployStep::Backup))?;
        if had_code {
            debug!(from = %code_path.display(), to = %backup_path.display(), "Backing up existing function code");
            tokio::fs::copy(&code_path, &backup_path)
                .await
                .map_err(FaasError::at(DeployStep::Backup))?;
        }

        debug!(path = %code_path.display(), "Writing function code");
        if let Err(e) = write_atomic(&code_path, &request.code).await {
            // The atomic write left the old file in place; only the backup needs to go.
            if had_code {
                let _ = remove_if_exists(&backup_path).await;
            }
            return Err(FaasError::at(DeployStep::Write)(e));
        }

        let provisioned = {
            let _manifest = self.manifest_locks.lock(project.to_string()).await;
            let manifest = request.manifest.as_deref().filter(|m| !m.is_empty());
            self.update_manifest_and_provision(project, manifest).await
        };

        if let Err(err) = provisioned {
            error!(error = %err, "Deployment failed, restoring previous function code");
            self.restore_code(&code_path, &backup_path, had_code).await?;
            return Err(err);
        }

        if had_code {
            if let Err(e) = remove_if_exists(&backup_path).await {
                warn!(path = %backup_path.display(), error = %e, "Failed to remove deployment backup");
            }
        }

        if let Some(env_vars) = request.env_vars.as_ref().filter(|vars| !vars.is_empty()) {
            debug!(keys = env_vars.len(), "Updating project environment variables");
            self.env_store
                .update_project_env(project, env_vars)
                .await
                .map_err(|e| {
                    error!(error = %e, "Environment update failed after code was committed");
                    FaasError::EnvUpdate {
                        project: project.to_string(),
                        reason: e.to_string(),
                    }
                })?;
        }

        info!("Function deployment complete");
        Ok(DeployReceipt::deployed(function))
    }

    /// Writes the supplied manifest and installs whatever manifest the project
    /// has. On failure a manifest written here is put back the way it was.
    async fn update_manifest_and_provision(
        &self,
        project: &str,
        manifest: Option<&[u8]>,
    ) -> Result<()> {
        let manifest_path = self.manifest_path(project);

        let previous = match manifest {
            Some(bytes) => {
                let previous = match tokio::fs::read(&manifest_path).await {
                    Ok(old) => PreviousManifest::Content(old),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => PreviousManifest::Absent,
                    Err(e) => return Err(FaasError::at(DeployStep::Manifest)(e)),
                };
                debug!(path = %manifest_path.display(), "Updating project manifest");
                write_atomic(&manifest_path, bytes)
                    .await
                    .map_err(FaasError::at(DeployStep::Manifest))?;
                Some(previous)
            }
            None => None,
        };

        let has_manifest = tokio::fs::try_exists(&manifest_path)
            .await
            .map_err(FaasError::at(DeployStep::Provision))?;
        if !has_manifest {
            debug!("Project has no manifest, skipping dependency install");
            return Ok(());
        }

        let installed = self
            .provisioner
            .install_manifest(project, &manifest_path)
            .await
            .map_err(|e| match e {
                FaasError::DependencyInstall { .. } => e,
                other => FaasError::DependencyInstall {
                    project: project.to_string(),
                    reason: other.to_string(),
                },
            });

        if let Err(err) = installed {
            error!(error = %err, "Failed to install project dependencies");
            match previous {
                Some(PreviousManifest::Content(old)) => {
                    debug!("Restoring previous project manifest");
                    write_atomic(&manifest_path, &old)
                        .await
                        .map_err(FaasError::at(DeployStep::Rollback))?;
                }
                Some(PreviousManifest::Absent) => {
                    debug!("Removing manifest introduced by the failed deployment");
                    remove_if_exists(&manifest_path)
                        .await
                        .map_err(FaasError::at(DeployStep::Rollback))?;
                }
                None => {}
            }
            return Err(err);
        }
        Ok(())
    }

    async fn restore_code(&self, code_path: &Path, backup_path: &Path, had_code: bool) -> Result<()> {
        if had_code {
            debug!(from = %backup_path.display(), to = %code_path.display(), "Restoring backup");
            tokio::fs::rename(backup_path, code_path)
                .await
                .map_err(FaasError::at(DeployStep::Rollback))?;
        } else {
            debug!(path = %code_path.display(), "Removing code of a function that did not exist before");
            remove_if_exists(code_path)
                .await
                .map_err(FaasError::at(DeployStep::Rollback))?;
        }
        Ok(())
    }

    /// Names of the functions that have a code file in the project directory.
    pub async fn list_functions(&self, project: &str) -> Result<Vec<String>> {
        validate_name("project", project)?;
        let dir = self.project_dir(project);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FaasError::NotFound(format!("Project {} not found", project)))
            }
            Err(e) => return Err(e.into()),
        };

        let mut functions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CODE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name("function", stem).is_ok() {
                    functions.push(stem.to_string());
                }
            }
        }
        functions.sort();
        debug!(%project, count = functions.len(), "Listed functions");
        Ok(functions)
    }

    /// Removes a function's code file. Waits for any deployment of the same
    /// function to finish first.
    #[instrument(skip(self))]
    pub async fn delete_function(&self, project: &str, function: &str) -> Result<()> {
        validate_name("project", project)?;
        validate_name("function", function)?;

        let _target = self
            .target_locks
            .lock((project.to_string(), function.to_string()))
            .await;

        let code_path = self.code_path(project, function);
        if !remove_if_exists(&code_path).await? {
            return Err(FaasError::NotFound(format!(
                "Function {} not found in project {}",
                function, project
            )));
        }
        remove_if_exists(&Self::backup_path(&code_path)).await?;
        info!("Function deleted");
        Ok(())
    }
}
