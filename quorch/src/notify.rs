use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregate::AggregateSummary;
use crate::events::{InProcEventBus, WorkflowEventPayload};
use crate::execution::{ExecutionId, ExecutionStatus};
use crate::runtime::ShutdownToken;

/// Terminal status message for one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<AggregateSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Notification {
    pub fn new(
        execution_id: ExecutionId,
        status: ExecutionStatus,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            status,
            start_time,
            end_time,
            summary: None,
            reason: None,
        }
    }

    pub fn with_summary(mut self, summary: AggregateSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// One-line subject, e.g. `quorch execution exec-1: SUCCEEDED`.
    pub fn subject(&self) -> String {
        format!("quorch execution {}: {}", self.execution_id, self.status)
    }
}

/// Sink for terminal status messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()>;
}

/// [`Notifier`] that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        info!(
            execution_id = %notification.execution_id,
            status = %notification.status,
            start_time = %notification.start_time,
            end_time = %notification.end_time,
            "{}",
            notification.subject()
        );
        Ok(())
    }
}

/// Publishes a notification whenever an execution ends FAILED, TIMED_OUT or
/// ABORTED.
///
/// The watch listens to the bus rather than being called by the
/// orchestrator, so a run that dies before reaching its Notify step still
/// produces a message. Executions whose Notify step already published are
/// skipped. The orchestrator publishes one `ExecutionFinished` per
/// execution, so every event that passes the filter is sent.
#[derive(Debug)]
pub struct FailureWatch {
    handle: JoinHandle<()>,
}

impl FailureWatch {
    /// Subscribe to `bus` and start watching. The subscription exists
    /// before this returns, so no terminal event published afterwards is
    /// missed.
    pub fn spawn(
        bus: &InProcEventBus,
        notifier: Arc<dyn Notifier>,
        shutdown: ShutdownToken,
    ) -> Self {
        let mut rx = bus.subscribe_terminal();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("failure watch shutting down");
                        break;
                    }
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let WorkflowEventPayload::ExecutionFinished {
                                status,
                                start_time,
                                end_time,
                                reason,
                                notified,
                            } = event.payload
                            else {
                                continue;
                            };
                            if !status.is_failure() || notified {
                                continue;
                            }
                            let execution_id = event.meta.correlation_id;
                            let mut notification = Notification::new(
                                execution_id.clone(),
                                status,
                                start_time,
                                end_time,
                            );
                            if let Some(reason) = reason {
                                notification = notification.with_reason(reason);
                            }
                            warn!(
                                execution_id = %execution_id,
                                status = %status,
                                "execution ended unsuccessfully; publishing failure notification"
                            );
                            if let Err(err) = notifier.publish(notification).await {
                                error!(
                                    execution_id = %execution_id,
                                    error = %err,
                                    "failure notification could not be published"
                                );
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("failure watch lagged, skipped {skipped} terminal events");
                        }
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the watch task to exit after shutdown.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            warn!("failure watch task failed: {err}");
        }
    }
}
