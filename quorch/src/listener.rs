use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::continuation::{ContinuationHub, ContinuationRecord};
use crate::error::ContinuationError;
use crate::events::{
    InProcEventBus, TaskState, TaskStateChange, WorkflowEvent, WorkflowEventPayload,
};
use crate::job::TerminalStatus;
use crate::runtime::ShutdownToken;
use crate::telemetry;

/// Redeems continuations from backend task-state-change events.
///
/// Events are matched to continuations by task id. Non-terminal states are
/// ignored; a terminal state redeems the continuation once, and any later
/// event for the same task is rejected by the store.
#[derive(Clone)]
pub struct TaskEventListener {
    hub: ContinuationHub,
    bus: Arc<InProcEventBus>,
}

impl std::fmt::Debug for TaskEventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEventListener")
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl TaskEventListener {
    pub fn new(hub: ContinuationHub, bus: Arc<InProcEventBus>) -> Self {
        Self { hub, bus }
    }

    /// Apply one state change.
    ///
    /// Returns the redeemed record, or `None` for a non-terminal state.
    pub async fn handle(
        &self,
        change: &TaskStateChange,
    ) -> Result<Option<ContinuationRecord>, ContinuationError> {
        if !change.state.is_terminal() {
            debug!(task_id = %change.task_id, state = ?change.state, "non-terminal task state");
            return Ok(None);
        }
        let status = match change.state {
            TaskState::Completed => TerminalStatus::Succeeded,
            state => TerminalStatus::Failed {
                reason: change
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("task ended in state {state:?}")),
            },
        };
        let succeeded = status.is_success();
        let span = telemetry::redeem_span(change.task_id.as_str());
        let record = self
            .hub
            .redeem(&change.task_id, status)
            .instrument(span)
            .await?;
        telemetry::record_continuation_redeemed(&record.execution_id, &change.task_id, succeeded);
        self.bus.publish_workflow(WorkflowEvent::new(
            &record.execution_id,
            WorkflowEventPayload::TaskRedeemed {
                task_id: change.task_id.clone(),
                succeeded,
            },
        ));
        Ok(Some(record))
    }

    /// Subscribe to the bus and redeem in the background until `shutdown`.
    pub fn spawn(self, shutdown: ShutdownToken) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe_tasks();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("task event listener shutting down");
                        break;
                    }
                    event = rx.recv() => match event {
                        Ok(change) => match self.handle(&change).await {
                            Ok(_) => {}
                            Err(ContinuationError::UnknownTask(task_id)) => {
                                debug!(task_id = %task_id, "state change for untracked task");
                            }
                            Err(err) => {
                                warn!(task_id = %change.task_id, error = %err, "task state change not applied");
                            }
                        },
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("task event listener lagged, skipped {skipped} events");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::InMemoryContinuationStore;
    use crate::execution::ExecutionId;
    use crate::job::{ComputeShape, JobKind, JobSpec};
    use std::time::Duration;

    fn setup() -> (TaskEventListener, ContinuationHub, Arc<InProcEventBus>) {
        let hub = ContinuationHub::new(Arc::new(InMemoryContinuationStore::new()));
        let bus = Arc::new(InProcEventBus::new(32));
        (TaskEventListener::new(hub.clone(), bus.clone()), hub, bus)
    }

    async fn register(hub: &ContinuationHub) -> (crate::continuation::ContinuationToken, JobSpec) {
        let spec = JobSpec::new(
            ExecutionId::new("exec-1"),
            JobKind::Quantum,
            ComputeShape::new(2, 2),
            vec![],
        );
        let token = hub
            .register(ContinuationRecord::for_spec(&spec))
            .await
            .unwrap();
        (token, spec)
    }

    #[tokio::test]
    async fn test_non_terminal_state_is_ignored() {
        let (listener, hub, _bus) = setup();
        let (_, spec) = register(&hub).await;
        let result = listener
            .handle(&TaskStateChange::new(spec.task_id.clone(), TaskState::Running))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(hub.store().pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_state_redeems_with_reason() {
        let (listener, hub, _bus) = setup();
        let (token, spec) = register(&hub).await;
        listener
            .handle(
                &TaskStateChange::new(spec.task_id.clone(), TaskState::Failed)
                    .with_reason("qubit calibration drift"),
            )
            .await
            .unwrap();
        let status = hub.await_redemption(&token).await.unwrap();
        assert_eq!(
            status,
            TerminalStatus::Failed {
                reason: "qubit calibration drift".into()
            }
        );
    }

    #[tokio::test]
    async fn test_second_terminal_event_is_rejected() {
        let (listener, hub, _bus) = setup();
        let (_, spec) = register(&hub).await;
        let change = TaskStateChange::new(spec.task_id.clone(), TaskState::Completed);
        listener.handle(&change).await.unwrap();
        let err = listener.handle(&change).await.unwrap_err();
        assert!(matches!(err, ContinuationError::AlreadyRedeemed(_)));
    }

    #[tokio::test]
    async fn test_spawned_listener_wakes_waiter() {
        let (listener, hub, bus) = setup();
        let (token, spec) = register(&hub).await;
        let mut workflow = bus.subscribe_workflow();
        let shutdown = ShutdownToken::new();
        let handle = listener.spawn(shutdown.clone());

        bus.publish_task(TaskStateChange::new(spec.task_id.clone(), TaskState::Completed));
        let status = tokio::time::timeout(Duration::from_secs(1), hub.await_redemption(&token))
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_success());

        let event = workflow.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            WorkflowEventPayload::TaskRedeemed { succeeded: true, .. }
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
