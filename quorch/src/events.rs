use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::backend::DeviceAvailability;
use crate::continuation::ContinuationToken;
use crate::execution::{ExecutionId, ExecutionStatus, RunMode};
use crate::job::{DeviceArn, JobId, TaskId};
use crate::ledger::{Branch, ItemMarker};
use crate::runtime::WorkflowState;

/// Metadata envelope attached to every workflow event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Execution the event belongs to.
    pub correlation_id: ExecutionId,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: ExecutionId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Orchestrator progress event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub meta: EventMeta,
    pub payload: WorkflowEventPayload,
}

impl WorkflowEvent {
    /// Wrap `payload` for `execution_id`, deriving the idempotency key from
    /// the payload.
    pub fn new(execution_id: &ExecutionId, payload: WorkflowEventPayload) -> Self {
        let key = format!("{}:{}", execution_id, payload.dedupe_suffix());
        Self {
            meta: EventMeta::new(execution_id.clone(), key),
            payload,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.meta.correlation_id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WorkflowEventPayload {
    ExecutionStarted {
        run_mode: RunMode,
        start_time: DateTime<Utc>,
    },
    StateEntered {
        state: WorkflowState,
    },
    ModelCreated {
        job_id: JobId,
        location: String,
        attempts: u16,
    },
    BranchDispatched {
        branch: Branch,
    },
    BranchFinished {
        branch: Branch,
        items: usize,
    },
    ItemTerminal {
        job_id: JobId,
        branch: Branch,
        marker: ItemMarker,
    },
    DeviceSkipped {
        device: DeviceArn,
        availability: DeviceAvailability,
    },
    TaskSuspended {
        task_id: TaskId,
        token: ContinuationToken,
    },
    TaskRedeemed {
        task_id: TaskId,
        succeeded: bool,
    },
    ExecutionFinished {
        status: ExecutionStatus,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Whether the orchestrator's own Notify step already published the
        /// terminal message.
        #[serde(default)]
        notified: bool,
    },
}

impl WorkflowEventPayload {
    fn dedupe_suffix(&self) -> String {
        match self {
            WorkflowEventPayload::ExecutionStarted { .. } => "started".to_string(),
            WorkflowEventPayload::StateEntered { state } => {
                format!("state:{}", state.as_str())
            }
            WorkflowEventPayload::ModelCreated { job_id, .. } => {
                format!("model:{job_id}")
            }
            WorkflowEventPayload::BranchDispatched { branch } => {
                format!("dispatched:{branch}")
            }
            WorkflowEventPayload::BranchFinished { branch, .. } => {
                format!("finished:{branch}")
            }
            WorkflowEventPayload::ItemTerminal { job_id, .. } => {
                format!("item:{job_id}")
            }
            WorkflowEventPayload::DeviceSkipped { device, .. } => {
                format!("skipped:{device}")
            }
            WorkflowEventPayload::TaskSuspended { task_id, .. } => {
                format!("suspended:{task_id}")
            }
            WorkflowEventPayload::TaskRedeemed { task_id, .. } => {
                format!("redeemed:{task_id}")
            }
            WorkflowEventPayload::ExecutionFinished { .. } => "finished".to_string(),
        }
    }
}

/// Device-side state of a quantum task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// State-change notification emitted by the quantum backend for a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStateChange {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceArn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskStateChange {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            device: None,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn with_device(mut self, device: DeviceArn) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Carries two streams: orchestrator [`WorkflowEvent`]s and backend
/// [`TaskStateChange`]s. Publishing never waits for slow subscribers; a
/// subscriber that falls more than `capacity` events behind receives
/// `RecvError::Lagged`.
///
/// `ExecutionFinished` events are additionally copied to a terminal-only
/// channel, so status watchers cannot be lagged out by item traffic.
pub struct InProcEventBus {
    workflow_sender: broadcast::Sender<WorkflowEvent>,
    terminal_sender: broadcast::Sender<WorkflowEvent>,
    task_sender: broadcast::Sender<TaskStateChange>,
    workflow_capacity: usize,
    task_capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("workflow_capacity", &self.workflow_capacity)
            .field("workflow_subscribers", &self.workflow_sender.receiver_count())
            .field("task_capacity", &self.task_capacity)
            .field("task_subscribers", &self.task_sender.receiver_count())
            .field("terminal_subscribers", &self.terminal_sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus with the same capacity for both channels.
    pub fn new(capacity: usize) -> Self {
        Self::with_capacities(capacity, capacity)
    }

    pub fn with_capacities(workflow_capacity: usize, task_capacity: usize) -> Self {
        let (workflow_sender, _) = broadcast::channel(workflow_capacity);
        let (terminal_sender, _) = broadcast::channel(workflow_capacity);
        let (task_sender, _) = broadcast::channel(task_capacity);
        Self {
            workflow_sender,
            terminal_sender,
            task_sender,
            workflow_capacity,
            task_capacity,
        }
    }

    pub fn workflow_subscriber_count(&self) -> usize {
        self.workflow_sender.receiver_count()
    }

    pub fn task_subscriber_count(&self) -> usize {
        self.task_sender.receiver_count()
    }

    pub fn workflow_capacity(&self) -> usize {
        self.workflow_capacity
    }

    pub fn task_capacity(&self) -> usize {
        self.task_capacity
    }

    /// Publish a workflow event. Dropped silently when nobody listens.
    pub fn publish_workflow(&self, event: WorkflowEvent) {
        if matches!(event.payload, WorkflowEventPayload::ExecutionFinished { .. }) {
            let _ = self.terminal_sender.send(event.clone());
        }
        let _ = self.workflow_sender.send(event);
    }

    /// Publish a task state change. Dropped silently when nobody listens.
    pub fn publish_task(&self, event: TaskStateChange) {
        let _ = self.task_sender.send(event);
    }

    pub fn subscribe_workflow(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.workflow_sender.subscribe()
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskStateChange> {
        self.task_sender.subscribe()
    }

    /// Subscribe to `ExecutionFinished` events only.
    pub fn subscribe_terminal(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.terminal_sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<WorkflowEvent> for InProcEventBus {
    async fn publish(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        self.publish_workflow(event);
        Ok(())
    }
}

#[async_trait]
impl EventPublisher<TaskStateChange> for InProcEventBus {
    async fn publish(&self, event: TaskStateChange) -> anyhow::Result<()> {
        self.publish_task(event);
        Ok(())
    }
}

impl EventSubscriber<WorkflowEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.subscribe_workflow()
    }
}

impl EventSubscriber<TaskStateChange> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<TaskStateChange> {
        self.subscribe_tasks()
    }
}
