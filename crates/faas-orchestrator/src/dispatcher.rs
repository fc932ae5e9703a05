//! End-to-end handling of a single invocation.

use crate::admission::AdmissionController;
use crate::lifecycle::LifecycleTracker;
use faas_common::{
    FaasError, InvocationId, InvocationResponse, ProjectBackend, ProjectRegistry, Result,
};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// How an invocation reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Holds an admission slot and is tracked by a lifecycle record.
    #[default]
    Admitted,
    /// Calls the project-scoped backend entry point without admission or
    /// lifecycle tracking.
    Direct,
}

/// Marks its record FAILED if dropped before the invocation settled, so a
/// cancelled invoke future never leaves a RUNNING record behind.
struct InFlight<'a> {
    lifecycle: &'a LifecycleTracker,
    id: InvocationId,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn complete(mut self) {
        self.settled = true;
        self.lifecycle.mark_completed(&self.id);
    }

    fn fail(mut self, error: &str) {
        self.settled = true;
        self.lifecycle.mark_failed(&self.id, error);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(invocation_id = %self.id, "Invocation dropped before completion");
            self.lifecycle
                .mark_failed(&self.id, "Invocation cancelled before completion");
        }
    }
}

pub struct Dispatcher {
    registry: Arc<dyn ProjectRegistry>,
    admission: AdmissionController,
    lifecycle: Arc<LifecycleTracker>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        admission: AdmissionController,
        lifecycle: Arc<LifecycleTracker>,
    ) -> Self {
        Self {
            registry,
            admission,
            lifecycle,
        }
    }

    /// Runs one invocation. Failures come back as an error-shaped response,
    /// never as a Rust error.
    #[instrument(skip(self, project, function, payload), fields(project = %project, function = %function))]
    pub async fn invoke(
        &self,
        project: &str,
        function: &str,
        payload: Value,
        mode: DispatchMode,
    ) -> InvocationResponse {
        match mode {
            DispatchMode::Admitted => self.invoke_admitted(project, function, payload).await,
            DispatchMode::Direct => match self.call_backend(project, function, payload, mode).await {
                Ok(result) => {
                    info!("Function execution complete");
                    InvocationResponse::success(None, result)
                }
                Err(e) => {
                    error!(error = %e, "Function invocation failed");
                    InvocationResponse::error(None, e.to_string())
                }
            },
        }
    }

    async fn invoke_admitted(&self, project: &str, function: &str, payload: Value) -> InvocationResponse {
        let slot = match self.admission.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "Admission failed");
                return InvocationResponse::error(None, e.to_string());
            }
        };

        let in_flight = InFlight {
            lifecycle: &self.lifecycle,
            id: self.lifecycle.create(project, function),
            settled: false,
        };
        let id = in_flight.id.clone();
        info!(invocation_id = %id, "Executing function");

        let response = match self
            .call_backend(project, function, payload, DispatchMode::Admitted)
            .await
        {
            Ok(result) => {
                in_flight.complete();
                info!(invocation_id = %id, "Function execution complete");
                InvocationResponse::success(Some(id), result)
            }
            Err(e) => {
                let message = e.to_string();
                in_flight.fail(&message);
                error!(invocation_id = %id, error = %message, "Error executing function");
                InvocationResponse::error(Some(id), message)
            }
        };

        slot.release();
        response
    }

    async fn resolve(&self, project: &str) -> Result<Arc<dyn ProjectBackend>> {
        self.registry
            .get_project(project)
            .await
            .ok_or_else(|| FaasError::BackendUnavailable(format!("Project {} not found", project)))
    }

    async fn call_backend(
        &self,
        project: &str,
        function: &str,
        payload: Value,
        mode: DispatchMode,
    ) -> Result<Value> {
        let backend = self.resolve(project).await?;
        let call = async {
            match mode {
                DispatchMode::Admitted => backend.execute_function(project, function, payload).await,
                DispatchMode::Direct => backend.execute_function_async(function, payload).await,
            }
        };
        AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(FaasError::Execution(format!(
                    "Backend panicked while executing {}/{}",
                    project, function
                )))
            })
    }
}
