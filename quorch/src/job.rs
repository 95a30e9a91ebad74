use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

use crate::execution::ExecutionId;

/// Identifier of one planned unit of work, assigned by the resolver.
///
/// Together with the execution id it keys the result row for the item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally visible task identifier.
///
/// It is embedded in the submission and echoed back by the backend in every
/// task-state-change event, which is how completions find their way back to
/// the suspended item.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the task id for a job of an execution.
    pub fn for_job(execution_id: &ExecutionId, job_id: JobId) -> Self {
        Self(format!("{}-{}", execution_id, job_id.0.simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a quantum device, e.g.
/// `arn:aws:braket:::device/qpu/d-wave/Advantage_system4`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceArn(String);

impl DeviceArn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the ARN, used for short labels.
    pub fn short_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl Display for DeviceArn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceArn {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of submitted job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    CreateModel,
    Classical,
    Quantum,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CreateModel => "create_model",
            JobKind::Classical => "cc",
            JobKind::Quantum => "qc",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute shape requested from the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ComputeShape {
    pub vcpus: u32,
    pub memory_gib: u32,
}

impl ComputeShape {
    pub fn new(vcpus: u32, memory_gib: u32) -> Self {
        Self { vcpus, memory_gib }
    }

    /// Label used in command arguments and result rows, e.g. `4_8`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.vcpus, self.memory_gib)
    }
}

/// One unit of submitted work. Built by the resolver, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub kind: JobKind,
    pub shape: ComputeShape,
    pub args: Vec<String>,
    /// Target device for quantum jobs; `None` for classical work.
    pub device: Option<DeviceArn>,
    /// The parameter combination this job evaluates.
    pub params: serde_json::Value,
}

impl JobSpec {
    pub fn new(
        execution_id: ExecutionId,
        kind: JobKind,
        shape: ComputeShape,
        args: Vec<String>,
    ) -> Self {
        let job_id = JobId::new();
        Self {
            job_id,
            task_id: TaskId::for_job(&execution_id, job_id),
            execution_id,
            kind,
            shape,
            args,
            device: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_device(mut self, device: DeviceArn) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Value following `flag` in the command arguments.
    pub fn arg(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Lifecycle of a submitted job as reported by the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Terminal outcome of a job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TerminalStatus {
    Succeeded,
    Failed { reason: String },
}

impl TerminalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Succeeded)
    }
}

/// Handle returned by the backend for a submitted job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    /// Backend-assigned identifier.
    pub backend_id: String,
    pub task_id: TaskId,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn submitted(spec: &JobSpec, backend_id: impl Into<String>) -> Self {
        Self {
            job_id: spec.job_id,
            backend_id: backend_id.into(),
            task_id: spec.task_id.clone(),
            status: JobStatus::Submitted,
            submitted_at: Utc::now(),
        }
    }
}
