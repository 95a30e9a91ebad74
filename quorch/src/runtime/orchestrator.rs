use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::aggregate::{AggregateSummary, Aggregator, ContextArchive};
use crate::backend::{DeviceOracle, JobBackend, TaskRunner, submit_and_wait};
use crate::budget::{FanOutBudget, FanOutLevel};
use crate::config::OrchestratorConfig;
use crate::continuation::{ContinuationHub, ContinuationRecord};
use crate::error::WorkflowError;
use crate::events::{InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::execution::{
    ExecutionContext, ExecutionId, ExecutionStatus, ModelArtifact, RunMode, SubmissionRequest,
};
use crate::fanout::{ItemPanicked, fan_out};
use crate::job::JobSpec;
use crate::ledger::{Branch, ItemMarker, ResultRecord, ResultSink};
use crate::listener::TaskEventListener;
use crate::notify::{FailureWatch, Notification, Notifier};
use crate::resolver::{ParameterResolver, Phase};
use crate::telemetry;

use super::signal::{AbortToken, ShutdownToken};
use super::{WorkflowState, cc, qc};

/// Collaborators shared by every execution of one orchestrator.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) resolver: Arc<dyn ParameterResolver>,
    pub(crate) backend: Arc<dyn JobBackend>,
    pub(crate) runner: Arc<dyn TaskRunner>,
    pub(crate) oracle: Arc<dyn DeviceOracle>,
    pub(crate) hub: ContinuationHub,
    pub(crate) ledger: Arc<dyn ResultSink>,
    pub(crate) aggregator: Arc<dyn Aggregator>,
    pub(crate) archive: Arc<dyn ContextArchive>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) bus: Arc<InProcEventBus>,
}

impl Services {
    pub(crate) fn publish(&self, execution_id: &ExecutionId, payload: WorkflowEventPayload) {
        self.bus
            .publish_workflow(WorkflowEvent::new(execution_id, payload));
    }

    pub(crate) fn enter(&self, execution_id: &ExecutionId, state: WorkflowState) {
        debug!(execution_id = %execution_id, state = %state, "entering state");
        self.publish(execution_id, WorkflowEventPayload::StateEntered { state });
    }

    /// Write an item's marker to the ledger and announce it.
    ///
    /// The write is retried per `ledger_retry`. A row that still cannot be
    /// written comes back as an error naming it, so the branch can fail the
    /// execution instead of aggregating fewer markers than it dispatched.
    pub(crate) async fn record_item(&self, record: ResultRecord) -> Result<(), String> {
        let execution_id = record.execution_id.clone();
        let job_id = record.job_id;
        let branch = record.branch;
        let marker = record.marker.clone();
        let policy = &self.config.ledger_retry;
        let mut attempts: u16 = 0;
        loop {
            attempts += 1;
            let delay = policy.delay_before(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.ledger.record(record.clone()).await {
                Ok(()) => break,
                Err(err) if policy.is_exhausted(attempts) => {
                    error!(
                        execution_id = %execution_id,
                        job_id = %job_id,
                        attempts,
                        error = %err,
                        "result row lost"
                    );
                    return Err(format!(
                        "result row for job {job_id} not written after {attempts} attempts: {err}"
                    ));
                }
                Err(err) => {
                    warn!(
                        execution_id = %execution_id,
                        job_id = %job_id,
                        attempt = attempts,
                        error = %err,
                        "result row write failed; retrying"
                    );
                }
            }
        }
        telemetry::record_item_terminal(&execution_id, branch.as_str(), marker.kind());
        self.publish(
            &execution_id,
            WorkflowEventPayload::ItemTerminal {
                job_id,
                branch,
                marker,
            },
        );
        Ok(())
    }

    /// Record a failed marker for each item whose task panicked, and
    /// collect every row that could not be written.
    pub(crate) async fn settle_items(
        &self,
        branch: Branch,
        specs: &[JobSpec],
        outcomes: Vec<Result<Result<(), String>, ItemPanicked>>,
    ) -> Vec<String> {
        let mut lost = Vec::new();
        for outcome in outcomes {
            let written = match outcome {
                Ok(written) => written,
                Err(panicked) => match specs.get(panicked.index) {
                    Some(spec) => {
                        let marker = ItemMarker::Failed {
                            reason: panicked.reason,
                        };
                        self.record_item(ResultRecord::for_spec(spec, branch, marker))
                            .await
                    }
                    None => Ok(()),
                },
            };
            if let Err(reason) = written {
                lost.push(format!("{}: {reason}", branch.as_str()));
            }
        }
        lost
    }
}

/// Per-branch result carried to the Aggregate step.
#[derive(Clone, Debug, Default)]
pub(crate) struct BranchReport {
    pub(crate) items: usize,
    /// Failures that stopped part of the branch before any item was built.
    pub(crate) failures: Vec<String>,
}

impl BranchReport {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self {
            items: 0,
            failures: vec![reason.into()],
        }
    }
}

/// Decides whether Notify or an interruption ends an execution.
///
/// Notify claims the gate before calling the notifier; the deadline and
/// abort claim it before tearing the run down. Only the first claim
/// succeeds, so a notification in flight is never followed by a failure
/// notification for the same execution.
#[derive(Clone, Debug, Default)]
pub(crate) struct EndGate(Arc<AtomicU8>);

impl EndGate {
    const OPEN: u8 = 0;
    const NOTIFYING: u8 = 1;
    const INTERRUPTED: u8 = 2;

    fn claim(&self, next: u8) -> bool {
        self.0
            .compare_exchange(Self::OPEN, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn claim_notify(&self) -> bool {
        self.claim(Self::NOTIFYING)
    }

    pub(crate) fn claim_interrupt(&self) -> bool {
        self.claim(Self::INTERRUPTED)
    }
}

/// Final result of an execution that reached its Notify step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    /// SUCCEEDED, or FAILED when a branch failed before producing items.
    pub status: ExecutionStatus,
    pub summary: AggregateSummary,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_failures: Vec<String>,
}

/// Running execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    abort: AbortToken,
    task: JoinHandle<Result<ExecutionOutcome, WorkflowError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// End the execution as ABORTED. Has no effect once it has finished.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the execution to end.
    pub async fn wait(self) -> Result<ExecutionOutcome, WorkflowError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(WorkflowError::Internal {
                execution_id: self.execution_id,
                reason: format!("execution task failed: {err}"),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Entry {
    Fresh,
    Resume,
}

/// Runs experiment executions end to end.
///
/// Each submission becomes one spawned task walking the
/// [`WorkflowState`] machine under a coarse deadline. [`start`](Self::start)
/// must be called first: it launches the task-event listener that redeems
/// suspended quantum items and the failure watch that reports executions
/// ending FAILED, TIMED_OUT or ABORTED.
pub struct Orchestrator {
    services: Services,
    shutdown_token: ShutdownToken,
    started: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
    failure_watch: Mutex<Option<FailureWatch>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let background = self
            .background
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("Orchestrator")
            .field("config", &self.services.config)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("background_tasks", &background)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(crate) fn new(services: Services) -> Self {
        Self {
            services,
            shutdown_token: ShutdownToken::new(),
            started: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
            failure_watch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.services.config
    }

    pub fn bus(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.services.bus)
    }

    pub fn hub(&self) -> ContinuationHub {
        self.services.hub.clone()
    }

    pub fn ledger(&self) -> Arc<dyn ResultSink> {
        Arc::clone(&self.services.ledger)
    }

    /// Start the task-event listener and the failure watch. Idempotent.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TaskEventListener::new(self.services.hub.clone(), self.bus());
        self.background
            .lock()
            .await
            .push(listener.spawn(self.shutdown_token.clone()));

        let watch = FailureWatch::spawn(
            &self.services.bus,
            Arc::clone(&self.services.notifier),
            self.shutdown_token.clone(),
        );
        *self.failure_watch.lock().await = Some(watch);
        info!("orchestrator started");
        Ok(())
    }

    /// Stop background tasks. Running executions are left alone; their
    /// continuations stay in the store for [`resume`](Self::resume).
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Initiating graceful shutdown of orchestrator");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.background.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {:?}", e),
                Err(_) => warn!("Background task timed out during shutdown"),
            }
        }
        if let Some(watch) = self.failure_watch.lock().await.take() {
            watch.join().await;
        }
        info!("Orchestrator shutdown complete");
        Ok(())
    }

    /// Start a new execution.
    pub fn submit(&self, request: SubmissionRequest) -> ExecutionHandle {
        let context = ExecutionContext::from_request(request);
        self.launch(context, Entry::Fresh)
    }

    /// Start a new execution and wait for it.
    pub async fn run(&self, request: SubmissionRequest) -> Result<ExecutionOutcome, WorkflowError> {
        self.submit(request).wait().await
    }

    /// Pick up an execution whose quantum items were suspended by an earlier
    /// process.
    ///
    /// Every outstanding continuation of the execution is awaited and
    /// recorded, then Aggregate and Notify run as usual. Items that never
    /// reached the continuation store are not re-run.
    pub fn resume(&self, context: ExecutionContext) -> ExecutionHandle {
        self.launch(context, Entry::Resume)
    }

    fn launch(&self, context: ExecutionContext, entry: Entry) -> ExecutionHandle {
        if !self.started.load(Ordering::SeqCst) {
            warn!(
                execution_id = %context.execution_id,
                "execution submitted before orchestrator start; quantum items will not be redeemed"
            );
        }
        let abort = AbortToken::new();
        let execution_id = context.execution_id.clone();
        let span = telemetry::execution_span(&execution_id, context.run_mode.as_str());
        let task = tokio::spawn(
            drive(self.services.clone(), context, entry, abort.clone()).instrument(span),
        );
        ExecutionHandle {
            execution_id,
            abort,
            task,
        }
    }
}

/// Run one execution under its deadline and abort token, then publish its
/// terminal event.
async fn drive(
    services: Services,
    context: ExecutionContext,
    entry: Entry,
    abort: AbortToken,
) -> Result<ExecutionOutcome, WorkflowError> {
    let execution_id = context.execution_id.clone();
    let start_time = context.start_time;
    info!(
        execution_id = %execution_id,
        run_mode = %context.run_mode,
        entry = ?entry,
        "execution started"
    );
    services.publish(
        &execution_id,
        WorkflowEventPayload::ExecutionStarted {
            run_mode: context.run_mode,
            start_time,
        },
    );

    let deadline = services.config.workflow_timeout();
    let gate = EndGate::default();
    let mut work =
        tokio::spawn(steps(services.clone(), context, entry, gate.clone()).in_current_span());
    let joined = tokio::select! {
        biased;
        joined = &mut work => Ok(joined),
        _ = tokio::time::sleep(deadline) => Err(WorkflowError::Timeout(execution_id.clone())),
        _ = abort.aborted() => Err(WorkflowError::Aborted(execution_id.clone())),
    };
    let joined = match joined {
        Ok(joined) => joined,
        Err(interruption) if gate.claim_interrupt() => {
            work.abort();
            warn!(execution_id = %execution_id, reason = %interruption, "execution interrupted");
            Ok(Err(interruption))
        }
        Err(interruption) => {
            // Notify already owns the ending.
            info!(
                execution_id = %execution_id,
                reason = %interruption,
                "interruption arrived during Notify; letting it finish"
            );
            work.await
        }
    };
    let result = joined.unwrap_or_else(|err| {
        Err(WorkflowError::Internal {
            execution_id: execution_id.clone(),
            reason: format!("execution task failed: {err}"),
        })
    });

    let (status, end_time, reason, notified) = match &result {
        Ok(outcome) => {
            services.enter(&execution_id, WorkflowState::Done);
            let reason = (!outcome.branch_failures.is_empty())
                .then(|| outcome.branch_failures.join("; "));
            (outcome.status, outcome.end_time, reason, true)
        }
        Err(err) => {
            if matches!(err, WorkflowError::Timeout(_) | WorkflowError::Aborted(_)) {
                release_outstanding(&services, &execution_id).await;
            }
            error!(execution_id = %execution_id, error = %err, "execution failed");
            services.enter(&execution_id, WorkflowState::Failed);
            let status = match err {
                WorkflowError::Timeout(_) => ExecutionStatus::TimedOut,
                WorkflowError::Aborted(_) => ExecutionStatus::Aborted,
                _ => ExecutionStatus::Failed,
            };
            (status, Utc::now(), Some(err.to_string()), false)
        }
    };

    let duration = (end_time - start_time).to_std().unwrap_or_default();
    telemetry::record_execution_finished(&execution_id, status.as_str(), duration.as_secs_f64());
    services.publish(
        &execution_id,
        WorkflowEventPayload::ExecutionFinished {
            status,
            start_time,
            end_time,
            reason,
            notified,
        },
    );
    result
}

/// Drop the continuations of an execution that will never await them.
async fn release_outstanding(services: &Services, execution_id: &ExecutionId) {
    let store = services.hub.store();
    let records = match store.outstanding(execution_id).await {
        Ok(records) => records,
        Err(err) => {
            warn!(execution_id = %execution_id, error = %err, "could not list outstanding continuations");
            return;
        }
    };
    for record in records {
        if let Err(err) = services.hub.cancel(&record.token).await {
            warn!(
                execution_id = %execution_id,
                task_id = %record.task_id,
                error = %err,
                "could not release continuation"
            );
        }
    }
}

async fn steps(
    services: Services,
    context: ExecutionContext,
    entry: Entry,
    gate: EndGate,
) -> Result<ExecutionOutcome, WorkflowError> {
    let (context, failures) = match entry {
        Entry::Fresh => {
            let context = validate_input(&services, context)?;
            let artifact = create_model(&services, &context).await?;
            let failures = run_branches(&services, &context, &artifact).await;
            (context, failures)
        }
        Entry::Resume => {
            let failures = recover(&services, &context).await?;
            (context, failures)
        }
    };
    conclude(&services, &context, failures, &gate).await
}

fn validate_input(
    services: &Services,
    context: ExecutionContext,
) -> Result<ExecutionContext, WorkflowError> {
    services.enter(&context.execution_id, WorkflowState::ValidateInput);
    let phase = Phase::CheckInput;
    let normalized = services
        .resolver
        .resolve(&phase, &context, None)
        .and_then(|resolved| resolved.into_input(&phase))
        .map_err(|err| WorkflowError::InvalidInput {
            execution_id: context.execution_id.clone(),
            reason: err.to_string(),
        })?;
    Ok(context.freeze(normalized))
}

/// Build the model, retrying per policy. Nothing else is submitted until
/// this returns an artifact.
async fn create_model(
    services: &Services,
    context: &ExecutionContext,
) -> Result<ModelArtifact, WorkflowError> {
    let execution_id = &context.execution_id;
    services.enter(execution_id, WorkflowState::CreateModel);
    let phase = Phase::CreateModel;
    let (spec, location) = services
        .resolver
        .resolve(&phase, context, None)
        .and_then(|resolved| resolved.into_model(&phase))
        .map_err(|err| WorkflowError::Internal {
            execution_id: execution_id.clone(),
            reason: err.to_string(),
        })?;

    let policy = &services.config.model_retry;
    let mut attempts: u16 = 0;
    loop {
        attempts += 1;
        let delay = policy.delay_before(attempts);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let timing = telemetry::record_job_start(spec.job_id.to_string());
        let outcome = submit_and_wait(services.backend.as_ref(), &spec)
            .instrument(telemetry::job_span(spec.job_id.to_string(), spec.kind.as_str()))
            .await;
        let reason = match outcome {
            Ok((_, status)) if status.is_success() => {
                telemetry::record_job_end(timing, execution_id, spec.kind.as_str(), "succeeded");
                info!(
                    execution_id = %execution_id,
                    job_id = %spec.job_id,
                    location = %location,
                    attempts,
                    "model created"
                );
                services.publish(
                    execution_id,
                    WorkflowEventPayload::ModelCreated {
                        job_id: spec.job_id,
                        location: location.clone(),
                        attempts,
                    },
                );
                return Ok(ModelArtifact {
                    execution_id: execution_id.clone(),
                    location,
                    job_id: spec.job_id,
                    created_at: Utc::now(),
                });
            }
            Ok((_, status)) => ItemMarker::from(status).label(),
            Err(err) => ItemMarker::from(err).label(),
        };
        telemetry::record_job_end(timing, execution_id, spec.kind.as_str(), "failed");

        if policy.is_exhausted(attempts) {
            return Err(WorkflowError::ModelCreationFailed {
                execution_id: execution_id.clone(),
                attempts,
                reason,
            });
        }
        warn!(
            execution_id = %execution_id,
            attempt = attempts,
            reason = %reason,
            "model creation failed; retrying"
        );
    }
}

/// Select and run the branches. Returns branch-level failures; item
/// failures are already in the ledger.
async fn run_branches(
    services: &Services,
    context: &ExecutionContext,
    artifact: &ModelArtifact,
) -> Vec<String> {
    let execution_id = &context.execution_id;
    services.enter(execution_id, WorkflowState::SelectMode);
    let reports = match context.run_mode {
        RunMode::Cc => {
            services.enter(execution_id, WorkflowState::RunCc);
            vec![cc::run(services, context, artifact).await]
        }
        RunMode::Qc => {
            services.enter(execution_id, WorkflowState::RunQc);
            vec![qc::run(services, context, artifact).await]
        }
        RunMode::Both => {
            services.enter(execution_id, WorkflowState::RunBoth);
            let (cc, qc) = tokio::join!(
                cc::run(services, context, artifact),
                qc::run(services, context, artifact)
            );
            vec![cc, qc]
        }
    };
    let items: usize = reports.iter().map(|report| report.items).sum();
    info!(execution_id = %execution_id, items, "branches finished");
    reports.into_iter().flat_map(|report| report.failures).collect()
}

/// Await every outstanding continuation of a resumed execution and record
/// its marker. Returns the rows that could not be written.
async fn recover(
    services: &Services,
    context: &ExecutionContext,
) -> Result<Vec<String>, WorkflowError> {
    let execution_id = &context.execution_id;
    services.enter(execution_id, WorkflowState::Recover);
    let records = services
        .hub
        .store()
        .outstanding(execution_id)
        .await
        .map_err(|err| WorkflowError::Internal {
            execution_id: execution_id.clone(),
            reason: format!("listing outstanding continuations: {err}"),
        })?;
    info!(
        execution_id = %execution_id,
        outstanding = records.len(),
        "resuming suspended items"
    );

    let budget = FanOutBudget::new(
        FanOutLevel::Recovery,
        execution_id.clone(),
        services.config.fan_out.device_param_width,
    );
    let specs: Vec<JobSpec> = records.iter().map(|record| record.spec.clone()).collect();
    let task_services = services.clone();
    let outcomes = fan_out(budget, records, move |record: ContinuationRecord| {
        let services = task_services.clone();
        async move {
            let marker = match services.hub.await_redemption(&record.token).await {
                Ok(status) => ItemMarker::from(status),
                Err(err) => ItemMarker::Failed {
                    reason: err.to_string(),
                },
            };
            services
                .record_item(ResultRecord::for_spec(&record.spec, Branch::Qc, marker))
                .await
        }
    })
    .await;

    Ok(services.settle_items(Branch::Qc, &specs, outcomes).await)
}

/// Aggregate once, archive, and notify once.
async fn conclude(
    services: &Services,
    context: &ExecutionContext,
    failures: Vec<String>,
    gate: &EndGate,
) -> Result<ExecutionOutcome, WorkflowError> {
    let execution_id = &context.execution_id;
    services.enter(execution_id, WorkflowState::Aggregate);
    let summary = services
        .aggregator
        .aggregate(execution_id)
        .await
        .map_err(|source| WorkflowError::Aggregation {
            execution_id: execution_id.clone(),
            source,
        })?;
    info!(
        execution_id = %execution_id,
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        submit_errors = summary.submit_errors,
        devices_not_online = summary.devices_not_online,
        "execution aggregated"
    );
    if let Err(err) = services.archive.archive(context, &summary).await {
        warn!(execution_id = %execution_id, error = %err, "execution archive write failed");
    }

    services.enter(execution_id, WorkflowState::Notify);
    let status = if failures.is_empty() {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::Failed
    };
    let end_time = Utc::now();
    let mut notification =
        Notification::new(execution_id.clone(), status, context.start_time, end_time)
            .with_summary(summary.clone());
    if !failures.is_empty() {
        notification = notification.with_reason(failures.join("; "));
    }
    if !gate.claim_notify() {
        // The deadline or abort won; the failure watch reports it.
        return Err(WorkflowError::Internal {
            execution_id: execution_id.clone(),
            reason: "interrupted before notify".to_string(),
        });
    }
    services
        .notifier
        .publish(notification)
        .await
        .map_err(|source| WorkflowError::Notification {
            execution_id: execution_id.clone(),
            source,
        })?;

    Ok(ExecutionOutcome {
        execution_id: execution_id.clone(),
        status,
        summary,
        start_time: context.start_time,
        end_time,
        branch_failures: failures,
    })
}
