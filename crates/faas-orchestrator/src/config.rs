use faas_common::{FaasError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Runtime configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// One directory per project holding `<function>.py` files and the manifest.
    pub projects_dir: PathBuf,
    /// One isolated environment per project.
    pub venvs_dir: PathBuf,
    /// One JSON file per project for [`crate::FileEnvStore`].
    pub envs_dir: PathBuf,
    /// Interpreter used to create project environments.
    pub python: String,
    pub max_concurrent_invocations: usize,
    /// Upper bound on provisioning child processes running at once.
    pub provision_workers: usize,
    pub gc_interval: Duration,
    pub gc_retry_interval: Duration,
    pub retention: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("cloudfunction/projects"),
            venvs_dir: PathBuf::from("cloudfunction/venvs"),
            envs_dir: PathBuf::from("cloudfunction/envs"),
            python: "python3".to_string(),
            max_concurrent_invocations: 10,
            provision_workers: 10,
            gc_interval: Duration::from_secs(300),
            gc_retry_interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        }
    }
}

impl ControlPlaneConfig {
    /// Loads `.env` if present, then overrides defaults from `FAAS_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("FAAS_PROJECTS_DIR") {
            config.projects_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FAAS_VENVS_DIR") {
            config.venvs_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FAAS_ENVS_DIR") {
            config.envs_dir = PathBuf::from(dir);
        }
        if let Some(python) = lookup("FAAS_PYTHON") {
            config.python = python;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "FAAS_MAX_CONCURRENT_INVOCATIONS")? {
            config.max_concurrent_invocations = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "FAAS_PROVISION_WORKERS")? {
            config.provision_workers = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FAAS_GC_INTERVAL_SECS")? {
            config.gc_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FAAS_GC_RETRY_SECS")? {
            config.gc_retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FAAS_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }

        config.validate()?;
        debug!(?config, "Loaded control plane configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_invocations == 0 {
            return Err(FaasError::Config(
                "max_concurrent_invocations must be at least 1".to_string(),
            ));
        }
        if self.provision_workers == 0 {
            return Err(FaasError::Config(
                "provision_workers must be at least 1".to_string(),
            ));
        }
        if self.gc_interval.is_zero() || self.gc_retry_interval.is_zero() {
            return Err(FaasError::Config(
                "garbage collection intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FaasError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
