use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::job::JobId;

/// Correlation key of one submitted experiment.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh, time-ordered execution id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which compute branches an execution dispatches to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunMode {
    Cc,
    Qc,
    #[default]
    Both,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Cc => "CC",
            RunMode::Qc => "QC",
            RunMode::Both => "BOTH",
        }
    }

    /// Select the run mode for a submission.
    ///
    /// Absent values select `Both`. Unrecognized values also select `Both`
    /// and log a warning, so a typo runs everything rather than failing.
    pub fn select(raw: Option<&str>, execution_id: &ExecutionId) -> RunMode {
        match raw.map(str::trim) {
            None | Some("") => RunMode::Both,
            Some(value) => match value.parse::<RunMode>() {
                Ok(mode) => mode,
                Err(UnknownRunMode(value)) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        run_mode = %value,
                        "unrecognized runMode; falling back to BOTH"
                    );
                    RunMode::Both
                }
            },
        }
    }
}

impl Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A run-mode string that names no known mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownRunMode(pub String);

impl FromStr for RunMode {
    type Err = UnknownRunMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CC" => Ok(RunMode::Cc),
            "QC" => Ok(RunMode::Qc),
            "BOTH" | "ALL" => Ok(RunMode::Both),
            _ => Err(UnknownRunMode(s.to_string())),
        }
    }
}

/// Payload accepted by the submission interface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmissionRequest {
    #[serde(rename = "executionID", default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(rename = "runMode", default, skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<String>,
    #[serde(rename = "userInput", default)]
    pub user_input: serde_json::Value,
}

impl SubmissionRequest {
    pub fn new(user_input: serde_json::Value) -> Self {
        Self {
            execution_id: None,
            run_mode: None,
            user_input,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_run_mode(mut self, run_mode: impl Into<String>) -> Self {
        self.run_mode = Some(run_mode.into());
        self
    }
}

/// Per-execution state shared read-only by every phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub run_mode: RunMode,
    pub start_time: DateTime<Utc>,
    user_input: Arc<serde_json::Value>,
    validated: bool,
}

impl ExecutionContext {
    /// Create the context for a submission, generating an id when absent.
    ///
    /// The run mode comes from the request, or from `userInput.runMode` when
    /// the request does not carry one.
    pub fn from_request(request: SubmissionRequest) -> Self {
        let execution_id = match request.execution_id {
            Some(id) if !id.trim().is_empty() => ExecutionId::new(id),
            _ => ExecutionId::generate(),
        };
        let raw_mode = request.run_mode.as_deref().or_else(|| {
            request
                .user_input
                .get("runMode")
                .and_then(serde_json::Value::as_str)
        });
        let run_mode = RunMode::select(raw_mode, &execution_id);
        Self {
            execution_id,
            run_mode,
            start_time: Utc::now(),
            user_input: Arc::new(request.user_input),
            validated: false,
        }
    }

    pub fn user_input(&self) -> &serde_json::Value {
        &self.user_input
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Replace the raw input with its normalized form and freeze it.
    pub fn freeze(self, normalized: serde_json::Value) -> Self {
        Self {
            user_input: Arc::new(normalized),
            validated: true,
            ..self
        }
    }
}

/// Location of the model built for an execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub execution_id: ExecutionId,
    pub location: String,
    /// Job that produced the artifact.
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Terminal status of a whole execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ExecutionStatus::Succeeded)
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
