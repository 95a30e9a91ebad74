use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;

use crate::error::BackendError;
use crate::job::{DeviceArn, JobHandle, JobSpec, TerminalStatus};

/// Container-job runner the orchestrator submits work to.
///
/// `submit` failing means the job never started and is reported as
/// [`BackendError::Submission`]. A job that started and then failed is
/// reported by `await_terminal`, either as `Ok(TerminalStatus::Failed)` or as
/// [`BackendError::Execution`]; both mean the same thing to the workflow.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job and return its handle without waiting for it to run.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError>;

    /// Wait until the job behind `handle` reaches a terminal status.
    async fn await_terminal(&self, handle: &JobHandle) -> Result<TerminalStatus, BackendError>;
}

/// Submit `spec` and wait for its terminal status.
///
/// A submission failure is returned as an error; everything after a
/// successful submit is folded into the returned status.
pub async fn submit_and_wait(
    backend: &dyn JobBackend,
    spec: &JobSpec,
) -> Result<(JobHandle, TerminalStatus), BackendError> {
    let handle = backend.submit(spec).await?;
    let status = match backend.await_terminal(&handle).await {
        Ok(status) => status,
        Err(BackendError::Execution(reason)) => TerminalStatus::Failed { reason },
        Err(BackendError::Submission(reason)) => TerminalStatus::Failed {
            reason: format!("status query failed: {reason}"),
        },
    };
    Ok((handle, status))
}

/// Availability of a quantum device at the time it was queried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeviceAvailability {
    Online,
    Offline,
    Unknown,
}

impl DeviceAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAvailability::Online => "ONLINE",
            DeviceAvailability::Offline => "OFFLINE",
            DeviceAvailability::Unknown => "UNKNOWN",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceAvailability::Online)
    }
}

impl Display for DeviceAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reports whether a device currently accepts tasks.
///
/// Queried once per device per execution; answers are never cached.
#[async_trait]
pub trait DeviceOracle: Send + Sync {
    async fn status(&self, device: &DeviceArn) -> Result<DeviceAvailability, BackendError>;
}

/// Starts quantum work without blocking on its completion.
///
/// Completion arrives later as a task-state-change event carrying the
/// spec's task id.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn start(&self, spec: &JobSpec) -> Result<JobHandle, BackendError>;
}

/// [`TaskRunner`] that submits through a [`JobBackend`] and returns
/// immediately.
#[derive(Clone)]
pub struct BackendTaskRunner {
    backend: Arc<dyn JobBackend>,
}

impl std::fmt::Debug for BackendTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTaskRunner").finish_non_exhaustive()
    }
}

impl BackendTaskRunner {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskRunner for BackendTaskRunner {
    async fn start(&self, spec: &JobSpec) -> Result<JobHandle, BackendError> {
        self.backend.submit(spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionId;
    use crate::job::{ComputeShape, JobKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBackend {
        submit_error: Option<BackendError>,
        terminal: Result<TerminalStatus, BackendError>,
        waits: AtomicUsize,
    }

    #[async_trait]
    impl JobBackend for FixedBackend {
        async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError> {
            match &self.submit_error {
                Some(err) => Err(err.clone()),
                None => Ok(JobHandle::submitted(spec, "batch-1")),
            }
        }

        async fn await_terminal(
            &self,
            _handle: &JobHandle,
        ) -> Result<TerminalStatus, BackendError> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.terminal.clone()
        }
    }

    fn spec() -> JobSpec {
        JobSpec::new(
            ExecutionId::new("exec-1"),
            JobKind::Classical,
            ComputeShape::new(2, 4),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_submit_error_skips_wait() {
        let backend = FixedBackend {
            submit_error: Some(BackendError::Submission("throttled".into())),
            terminal: Ok(TerminalStatus::Succeeded),
            waits: AtomicUsize::new(0),
        };
        let result = submit_and_wait(&backend, &spec()).await;
        assert_eq!(
            result.map(|(_, status)| status),
            Err(BackendError::Submission("throttled".into()))
        );
        assert_eq!(backend.waits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execution_error_becomes_failed_status() {
        let backend = FixedBackend {
            submit_error: None,
            terminal: Err(BackendError::Execution("exit code 137".into())),
            waits: AtomicUsize::new(0),
        };
        let (handle, status) = submit_and_wait(&backend, &spec()).await.unwrap();
        assert_eq!(handle.backend_id, "batch-1");
        assert_eq!(
            status,
            TerminalStatus::Failed {
                reason: "exit code 137".into()
            }
        );
    }

    #[tokio::test]
    async fn test_task_runner_submits_without_waiting() {
        let backend = Arc::new(FixedBackend {
            submit_error: None,
            terminal: Ok(TerminalStatus::Succeeded),
            waits: AtomicUsize::new(0),
        });
        let runner = BackendTaskRunner::new(backend.clone());
        let spec = spec();
        let handle = runner.start(&spec).await.unwrap();
        assert_eq!(handle.task_id, spec.task_id);
        assert_eq!(backend.waits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_device_availability_labels() {
        assert!(DeviceAvailability::Online.is_online());
        assert!(!DeviceAvailability::Unknown.is_online());
        assert_eq!(DeviceAvailability::Offline.to_string(), "OFFLINE");
    }
}
