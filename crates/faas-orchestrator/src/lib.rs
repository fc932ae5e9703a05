use faas_common::{
    DeployReceipt, DeploymentRequest, EnvStore, FaasError, InvocationId, InvocationRecord,
    InvocationResponse, ProjectRegistry, Result, RuntimeProvisioner,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod admission;
pub mod config;
pub mod deploy;
pub mod dispatcher;
pub mod env_store;
mod fsutil;
pub mod gc;
mod keyed_lock;
pub mod lifecycle;
pub mod provisioner;
pub mod validate;

pub use admission::{AdmissionController, AdmissionSlot};
pub use config::ControlPlaneConfig;
pub use deploy::DeploymentManager;
pub use dispatcher::{DispatchMode, Dispatcher};
pub use env_store::{FileEnvStore, InMemoryEnvStore};
pub use faas_common as common;
pub use gc::{GarbageCollector, GcHandle};
pub use lifecycle::LifecycleTracker;
pub use provisioner::VenvProvisioner;

/// Wires the admission controller, lifecycle tracker, garbage collector,
/// dispatcher and deployment manager around the external collaborators.
pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    registry: Option<Arc<dyn ProjectRegistry>>,
    provisioner: Option<Arc<dyn RuntimeProvisioner>>,
    env_store: Option<Arc<dyn EnvStore>>,
    start_gc: bool,
}

impl ControlPlaneBuilder {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            config,
            registry: None,
            provisioner: None,
            env_store: None,
            start_gc: true,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn ProjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to a [`VenvProvisioner`] over `config.venvs_dir`.
    pub fn provisioner(mut self, provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Defaults to a [`FileEnvStore`] over `config.envs_dir`.
    pub fn env_store(mut self, env_store: Arc<dyn EnvStore>) -> Self {
        self.env_store = Some(env_store);
        self
    }

    /// Skip the background collector; sweeps then only happen through
    /// [`ControlPlane::collect_garbage`].
    pub fn without_gc(mut self) -> Self {
        self.start_gc = false;
        self
    }

    pub fn build(self) -> Result<ControlPlane> {
        self.config.validate()?;
        let registry = self.registry.ok_or_else(|| {
            FaasError::Uninitialized("control plane has no project registry".to_string())
        })?;
        let provisioner = self
            .provisioner
            .unwrap_or_else(|| {
                Arc::new(VenvProvisioner::new(&self.config)) as Arc<dyn RuntimeProvisioner>
            });
        let env_store = self
            .env_store
            .unwrap_or_else(|| {
                Arc::new(FileEnvStore::new(self.config.envs_dir.clone())) as Arc<dyn EnvStore>
            });

        let admission = AdmissionController::new(self.config.max_concurrent_invocations);
        let lifecycle = Arc::new(LifecycleTracker::new());
        let collector = GarbageCollector::new(lifecycle.clone(), &self.config);
        let gc = if self.start_gc {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(FaasError::Uninitialized(
                    "garbage collector needs a running Tokio runtime".to_string(),
                ));
            }
            Some(collector.clone().spawn())
        } else {
            None
        };

        info!(
            max_concurrent = self.config.max_concurrent_invocations,
            projects_dir = %self.config.projects_dir.display(),
            "Control plane initialized"
        );

        Ok(ControlPlane {
            dispatcher: Dispatcher::new(registry, admission.clone(), lifecycle.clone()),
            deployments: DeploymentManager::new(
                self.config.projects_dir.clone(),
                provisioner.clone(),
                env_store.clone(),
            ),
            config: self.config,
            admission,
            lifecycle,
            collector,
            provisioner,
            env_store,
            _gc: gc,
        })
    }
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    admission: AdmissionController,
    lifecycle: Arc<LifecycleTracker>,
    collector: GarbageCollector,
    dispatcher: Dispatcher,
    deployments: DeploymentManager,
    provisioner: Arc<dyn RuntimeProvisioner>,
    env_store: Arc<dyn EnvStore>,
    _gc: Option<GcHandle>,
}

impl ControlPlane {
    pub fn builder(config: ControlPlaneConfig) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config)
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Admission-controlled, lifecycle-tracked invocation.
    pub async fn invoke(&self, project: &str, function: &str, payload: Value) -> InvocationResponse {
        self.dispatcher
            .invoke(project, function, payload, DispatchMode::Admitted)
            .await
    }

    pub async fn invoke_with(
        &self,
        project: &str,
        function: &str,
        payload: Value,
        mode: DispatchMode,
    ) -> InvocationResponse {
        self.dispatcher.invoke(project, function, payload, mode).await
    }

    pub async fn deploy(&self, project: &str, request: DeploymentRequest) -> Result<DeployReceipt> {
        self.deployments.deploy(project, request).await
    }

    pub async fn list_functions(&self, project: &str) -> Result<Vec<String>> {
        self.deployments.list_functions(project).await
    }

    pub async fn delete_function(&self, project: &str, function: &str) -> Result<()> {
        self.deployments.delete_function(project, function).await
    }

    pub fn get_status(&self, id: &InvocationId) -> Option<InvocationRecord> {
        self.lifecycle.get(id)
    }

    pub fn list_invocations(&self) -> HashMap<InvocationId, InvocationRecord> {
        self.lifecycle.list_all()
    }

    pub fn available_slots(&self) -> usize {
        self.admission.available()
    }

    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    /// Runs one garbage collection sweep now.
    pub async fn collect_garbage(&self) -> Result<usize> {
        self.collector.sweep_once().await
    }

    pub async fn project_env(&self, project: &str) -> Result<HashMap<String, String>> {
        validate::validate_name("project", project)?;
        self.env_store.get_project_env(project).await
    }

    /// Opens a project-scoped handle, creating the project's runtime
    /// environment if it does not exist yet.
    #[instrument(skip(self))]
    pub async fn project(&self, name: &str) -> Result<ProjectScope<'_>> {
        validate::validate_name("project", name)?;
        self.provisioner.ensure_environment(name).await?;
        Ok(ProjectScope {
            plane: self,
            name: name.to_string(),
        })
    }
}

/// Operations bound to one project.
pub struct ProjectScope<'a> {
    plane: &'a ControlPlane,
    name: String,
}

impl ProjectScope<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, function: &str, payload: Value) -> InvocationResponse {
        self.plane.invoke(&self.name, function, payload).await
    }

    pub async fn invoke_direct(&self, function: &str, payload: Value) -> InvocationResponse {
        self.plane
            .invoke_with(&self.name, function, payload, DispatchMode::Direct)
            .await
    }

    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeployReceipt> {
        self.plane.deploy(&self.name, request).await
    }

    pub async fn list_functions(&self) -> Result<Vec<String>> {
        self.plane.list_functions(&self.name).await
    }

    pub async fn delete_function(&self, function: &str) -> Result<()> {
        self.plane.delete_function(&self.name, function).await
    }

    pub async fn env(&self) -> Result<HashMap<String, String>> {
        self.plane.project_env(&self.name).await
    }
}
