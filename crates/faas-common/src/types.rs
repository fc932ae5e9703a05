use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;

/// Identifier of one admitted invocation attempt. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    /// `<project>:<function>:<unix-micros>:<seq>`
    pub fn compose(project: &str, function: &str, started_at: DateTime<Utc>, seq: u64) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            project,
            function,
            started_at.timestamp_micros(),
            seq
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InvocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Running,
    Completed,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: InvocationId,
    pub project: String,
    pub function: String,
    pub state: InvocationState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl InvocationRecord {
    pub fn running(
        id: InvocationId,
        project: impl Into<String>,
        function: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project: project.into(),
            function: function.into(),
            state: InvocationState::Running,
            start_time,
            end_time: None,
            error: None,
        }
    }

    /// Moves a RUNNING record to COMPLETED. Returns false and leaves the
    /// record untouched if it already reached a terminal state.
    pub fn complete(&mut self, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = InvocationState::Completed;
        self.end_time = Some(at);
        true
    }

    /// Moves a RUNNING record to FAILED with the given error.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = InvocationState::Failed;
        self.end_time = Some(at);
        self.error = Some(error.into());
        true
    }
}

/// Result shape returned by every dispatch path. Serializes to
/// `{"status": "success", "result": ...}` or `{"status": "error", "error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvokeOutcome {
    Success { result: Value },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Absent for direct dispatch, which does not create lifecycle records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<InvocationId>,
    #[serde(flatten)]
    pub outcome: InvokeOutcome,
}

impl InvocationResponse {
    pub fn success(invocation_id: Option<InvocationId>, result: Value) -> Self {
        Self {
            invocation_id,
            outcome: InvokeOutcome::Success { result },
        }
    }

    pub fn error(invocation_id: Option<InvocationId>, error: impl Into<String>) -> Self {
        Self {
            invocation_id,
            outcome: InvokeOutcome::Error {
                error: error.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvokeOutcome::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            InvokeOutcome::Error { error } => Some(error),
            InvokeOutcome::Success { .. } => None,
        }
    }
}

/// One deployment attempt. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct DeploymentRequest {
    pub function: String,
    pub code: Vec<u8>,
    /// `None` keeps whatever manifest the project already has.
    pub manifest: Option<Vec<u8>>,
    pub env_vars: Option<HashMap<String, String>>,
}

impl DeploymentRequest {
    pub fn new(function: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            function: function.into(),
            code: code.into(),
            manifest: None,
            env_vars: None,
        }
    }

    pub fn with_manifest(mut self, manifest: impl Into<Vec<u8>>) -> Self {
        self.manifest = Some(manifest.into());
        self
    }

    pub fn with_env_vars(mut self, env_vars: HashMap<String, String>) -> Self {
        self.env_vars = Some(env_vars);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    pub status: String,
    pub message: String,
    pub function_name: String,
}

impl DeployReceipt {
    pub fn deployed(function_name: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: format!("Function {} deployed successfully", function_name),
            function_name: function_name.to_string(),
        }
    }
}
