//! Per-project virtual environments driven through child processes.

use crate::config::ControlPlaneConfig;
use crate::keyed_lock::KeyedLocks;
use async_trait::async_trait;
use faas_common::{FaasError, Result, RuntimeProvisioner};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

/// Creates `<venvs_dir>/<project>` with `<python> -m venv` and installs
/// manifests with the environment's own pip. Child processes are bounded by
/// a worker semaphore so provisioning never floods the host.
#[derive(Debug)]
pub struct VenvProvisioner {
    venvs_dir: PathBuf,
    python: String,
    workers: Arc<Semaphore>,
    env_locks: KeyedLocks<String>,
}

impl VenvProvisioner {
    pub fn new(config: &ControlPlaneConfig) -> Self {
        Self {
            venvs_dir: config.venvs_dir.clone(),
            python: config.python.clone(),
            workers: Arc::new(Semaphore::new(config.provision_workers)),
            env_locks: KeyedLocks::new(),
        }
    }

    pub fn venv_path(&self, project: &str) -> PathBuf {
        self.venvs_dir.join(project)
    }

    pub fn venv_pip(&self, project: &str) -> PathBuf {
        if cfg!(windows) {
            self.venv_path(project).join("Scripts").join("pip.exe")
        } else {
            self.venv_path(project).join("bin").join("pip")
        }
    }

    async fn run(&self, project: &str, mut command: Command, what: &str) -> Result<()> {
        let _worker = self
            .workers
            .acquire()
            .await
            .map_err(|_| FaasError::Internal("Provisioning worker pool closed".to_string()))?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|e| FaasError::DependencyInstall {
            project: project.to_string(),
            reason: format!("{} could not be started: {}", what, e),
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        error!(%project, status = %output.status, %detail, "{} failed", what);
        Err(FaasError::DependencyInstall {
            project: project.to_string(),
            reason: format!("{} exited with {}: {}", what, output.status, detail),
        })
    }
}

#[async_trait]
impl RuntimeProvisioner for VenvProvisioner {
    #[instrument(skip(self), fields(venvs_dir = %self.venvs_dir.display()))]
    async fn ensure_environment(&self, project: &str) -> Result<()> {
        let _guard = self.env_locks.lock(project.to_string()).await;

        let venv_path = self.venv_path(project);
        if tokio::fs::try_exists(&venv_path).await? {
            debug!(%project, "Virtual environment already present");
            return Ok(());
        }

        info!(%project, path = %venv_path.display(), "Creating virtual environment");
        tokio::fs::create_dir_all(&self.venvs_dir).await?;
        let mut command = Command::new(&self.python);
        command.arg("-m").arg("venv").arg(&venv_path);
        self.run(project, command, "venv creation").await
    }

    #[instrument(skip(self), fields(manifest = %manifest_path.display()))]
    async fn install_manifest(&self, project: &str, manifest_path: &Path) -> Result<()> {
        self.ensure_environment(project).await?;

        info!(%project, "Installing project dependencies");
        let mut command = Command::new(self.venv_pip(project));
        command.arg("install").arg("-r").arg(manifest_path);
        self.run(project, command, "pip install").await
    }
}
