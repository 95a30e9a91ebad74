use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::backend::DeviceAvailability;
use crate::error::BackendError;
use crate::execution::ExecutionId;
use crate::job::{DeviceArn, JobId, JobSpec, TaskId, TerminalStatus};

/// Compute path an item belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Branch {
    Cc,
    Qc,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Cc => "cc",
            Branch::Qc => "qc",
        }
    }
}

impl Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of one fan-out item, recorded as data.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemMarker {
    Succeeded,
    /// The job ran and failed.
    Failed { reason: String },
    /// The job could not be submitted.
    SubmitError { reason: String },
    /// The device was not online, so nothing was submitted to it.
    DeviceNotOnline {
        device: DeviceArn,
        availability: DeviceAvailability,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ItemMarker {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemMarker::Succeeded => "succeeded",
            ItemMarker::Failed { .. } => "failed",
            ItemMarker::SubmitError { .. } => "submit_error",
            ItemMarker::DeviceNotOnline { .. } => "device_not_online",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemMarker::Succeeded)
    }

    /// Human-readable label, as shown in the aggregated table.
    pub fn label(&self) -> String {
        match self {
            ItemMarker::Succeeded => "Succeeded".to_string(),
            ItemMarker::Failed { reason } => format!("Failed: {reason}"),
            ItemMarker::SubmitError { reason } => format!("Submit Error: {reason}"),
            ItemMarker::DeviceNotOnline {
                device,
                availability,
                ..
            } => format!("Device Not Online: {} ({availability})", device.short_name()),
        }
    }
}

impl From<TerminalStatus> for ItemMarker {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Succeeded => ItemMarker::Succeeded,
            TerminalStatus::Failed { reason } => ItemMarker::Failed { reason },
        }
    }
}

impl From<BackendError> for ItemMarker {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Submission(reason) => ItemMarker::SubmitError { reason },
            BackendError::Execution(reason) => ItemMarker::Failed { reason },
        }
    }
}

/// One aggregated result row, keyed by `(execution_id, job_id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultRecord {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub branch: Branch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceArn>,
    pub params: serde_json::Value,
    pub marker: ItemMarker,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Row for an item that was resolved into a job spec.
    pub fn for_spec(spec: &JobSpec, branch: Branch, marker: ItemMarker) -> Self {
        Self {
            execution_id: spec.execution_id.clone(),
            job_id: spec.job_id,
            branch,
            task_id: Some(spec.task_id.clone()),
            device: spec.device.clone(),
            params: spec.params.clone(),
            marker,
            recorded_at: Utc::now(),
        }
    }

    /// Row for a device that was skipped before any job was resolved.
    pub fn device_skipped(
        execution_id: &ExecutionId,
        device: &DeviceArn,
        availability: DeviceAvailability,
        detail: Option<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            job_id: JobId::new(),
            branch: Branch::Qc,
            task_id: None,
            device: Some(device.clone()),
            params: serde_json::Value::Null,
            marker: ItemMarker::DeviceNotOnline {
                device: device.clone(),
                availability,
                detail,
            },
            recorded_at: Utc::now(),
        }
    }
}

/// Where item results are written as they reach a terminal state.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store a row. A second row for the same `(execution_id, job_id)` is
    /// ignored.
    async fn record(&self, record: ResultRecord) -> anyhow::Result<()>;

    /// All rows of an execution in recording order.
    async fn records(&self, execution_id: &ExecutionId) -> anyhow::Result<Vec<ResultRecord>>;
}

/// In-memory [`ResultSink`].
#[derive(Clone, Default)]
pub struct InMemoryResultLedger {
    rows: Arc<Mutex<HashMap<ExecutionId, Vec<ResultRecord>>>>,
}

impl std::fmt::Debug for InMemoryResultLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryResultLedger");
        match self.rows.try_lock() {
            Ok(rows) => {
                debug.field("executions", &rows.len());
            }
            Err(_) => {
                debug.field("executions", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl InMemoryResultLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultLedger {
    async fn record(&self, record: ResultRecord) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().await;
        let execution_rows = rows.entry(record.execution_id.clone()).or_default();
        if execution_rows.iter().any(|r| r.job_id == record.job_id) {
            warn!(
                execution_id = %record.execution_id,
                job_id = %record.job_id,
                "duplicate result row ignored"
            );
            return Ok(());
        }
        execution_rows.push(record);
        Ok(())
    }

    async fn records(&self, execution_id: &ExecutionId) -> anyhow::Result<Vec<ResultRecord>> {
        let rows = self.rows.lock().await;
        Ok(rows.get(execution_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ComputeShape, JobKind};
    use serde_json::json;

    fn spec() -> JobSpec {
        JobSpec::new(
            ExecutionId::new("exec-1"),
            JobKind::Quantum,
            ComputeShape::new(2, 2),
            vec![],
        )
        .with_device(DeviceArn::from("arn:aws:braket:::device/qpu/d-wave/A"))
        .with_params(json!({"M": 1, "D": 4}))
    }

    #[test]
    fn test_backend_errors_map_to_distinct_markers() {
        assert_eq!(
            ItemMarker::from(BackendError::Submission("quota".into())).kind(),
            "submit_error"
        );
        assert_eq!(
            ItemMarker::from(BackendError::Execution("oom".into())).kind(),
            "failed"
        );
    }

    #[test]
    fn test_marker_labels() {
        let skipped = ResultRecord::device_skipped(
            &ExecutionId::new("exec-1"),
            &DeviceArn::from("arn:aws:braket:::device/qpu/ionq/Harmony"),
            DeviceAvailability::Offline,
            None,
        );
        assert_eq!(skipped.marker.label(), "Device Not Online: Harmony (OFFLINE)");
        assert!(skipped.task_id.is_none());
        assert_eq!(
            ItemMarker::SubmitError {
                reason: "quota".into()
            }
            .label(),
            "Submit Error: quota"
        );
    }

    #[test]
    fn test_record_serializes_tagged_marker() {
        let record = ResultRecord::for_spec(&spec(), Branch::Qc, ItemMarker::Succeeded);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["marker"]["kind"], "succeeded");
        assert_eq!(value["branch"], "Qc");
        assert_eq!(value["params"]["D"], 4);
    }

    #[tokio::test]
    async fn test_ledger_ignores_duplicate_rows() {
        let ledger = InMemoryResultLedger::new();
        let spec = spec();
        ledger
            .record(ResultRecord::for_spec(&spec, Branch::Qc, ItemMarker::Succeeded))
            .await
            .unwrap();
        ledger
            .record(ResultRecord::for_spec(
                &spec,
                Branch::Qc,
                ItemMarker::Failed {
                    reason: "late".into(),
                },
            ))
            .await
            .unwrap();

        let rows = ledger.records(&spec.execution_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].marker.is_success());
        assert!(
            ledger
                .records(&ExecutionId::new("other"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
