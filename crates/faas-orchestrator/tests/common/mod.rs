//! Mock collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use faas_common::{FaasError, ProjectBackend, ProjectRegistry, Result, RuntimeProvisioner};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum MockBehavior {
    Success { result: Value, delay_ms: u64 },
    Failure { error: String, delay_ms: u64 },
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior::Success {
            result: json!("OK"),
            delay_ms: 0,
        }
    }
}

/// Backend that records how many calls overlap.
#[derive(Default)]
pub struct MockBackend {
    behavior: Mutex<MockBehavior>,
    pub calls: AtomicUsize,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl MockBackend {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            ..Default::default()
        })
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn run(&self, payload: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let behavior = self.behavior.lock().unwrap().clone();
        let result = match behavior {
            MockBehavior::Success { result, delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(json!({ "result": result, "echo": payload }))
            }
            MockBehavior::Failure { error, delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Err(FaasError::Execution(error))
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ProjectBackend for MockBackend {
    async fn execute_function(&self, _project: &str, _function: &str, payload: Value) -> Result<Value> {
        self.run(payload).await
    }

    async fn execute_function_async(&self, _function: &str, payload: Value) -> Result<Value> {
        self.run(payload).await
    }
}

#[derive(Default)]
pub struct StaticRegistry {
    projects: HashMap<String, Arc<dyn ProjectBackend>>,
}

impl StaticRegistry {
    pub fn with(project: &str, backend: Arc<MockBackend>) -> Arc<Self> {
        let mut projects: HashMap<String, Arc<dyn ProjectBackend>> = HashMap::new();
        projects.insert(project.to_string(), backend);
        Arc::new(Self { projects })
    }
}

#[async_trait]
impl ProjectRegistry for StaticRegistry {
    async fn get_project(&self, name: &str) -> Option<Arc<dyn ProjectBackend>> {
        self.projects.get(name).cloned()
    }
}

/// Provisioner that can be told to fail and remembers what the function
/// code looked like whenever an install ran.
#[derive(Default)]
pub struct RecordingProvisioner {
    pub fail_installs: AtomicBool,
    pub install_delay_ms: AtomicUsize,
    pub ensured: Mutex<Vec<String>>,
    pub installs: Mutex<Vec<PathBuf>>,
    /// `(function file, content at install time)` pairs.
    pub observed_code: Mutex<Vec<(PathBuf, String)>>,
    pub watch: Mutex<Vec<PathBuf>>,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let provisioner = Self::default();
        provisioner.fail_installs.store(true, Ordering::SeqCst);
        Arc::new(provisioner)
    }

    pub fn watch_file(&self, path: PathBuf) {
        self.watch.lock().unwrap().push(path);
    }
}

#[async_trait]
impl RuntimeProvisioner for RecordingProvisioner {
    async fn ensure_environment(&self, project: &str) -> Result<()> {
        self.ensured.lock().unwrap().push(project.to_string());
        Ok(())
    }

    async fn install_manifest(&self, project: &str, manifest_path: &Path) -> Result<()> {
        self.installs.lock().unwrap().push(manifest_path.to_path_buf());
        let watched = self.watch.lock().unwrap().clone();
        for path in watched {
            if let Ok(content) = std::fs::read_to_string(&path) {
                self.observed_code.lock().unwrap().push((path, content));
            }
        }

        let delay = self.install_delay_ms.load(Ordering::SeqCst) as u64;
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(FaasError::DependencyInstall {
                project: project.to_string(),
                reason: "pip install exited with status 1".to_string(),
            });
        }
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
