//! End-to-end executions against scripted collaborators.
//!
//! Covers branch selection, device skipping, per-item failure isolation,
//! model retry, the exactly-once aggregate and notify steps, lost result
//! rows, and the terminal paths for invalid input, timeout and abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use quorch::runtime::{OrchestratorBuilder, WorkflowState};
use quorch::*;
use quorch_testkit::{
    DEVICE_A, DEVICE_B, ExperimentInputBuilder, Outcome, RecordingNotifier, ScriptedBackend,
    StaticDeviceOracle, TestHarness, test_config,
};
use serde_json::json;
use tokio::time::timeout;

async fn harness(backend: ScriptedBackend, oracle: StaticDeviceOracle) -> TestHarness {
    TestHarness::start(test_config(), backend, oracle)
        .await
        .expect("harness should start")
}

fn device_of(record: &ResultRecord) -> Option<&str> {
    record.device.as_ref().map(DeviceArn::as_str)
}

/// Poll until the execution has `count` outstanding continuations.
async fn wait_for_outstanding(h: &TestHarness, execution_id: &ExecutionId, count: usize) {
    let store = h.orchestrator.hub().store();
    timeout(Duration::from_secs(5), async {
        loop {
            let outstanding = store.outstanding(execution_id).await.unwrap_or_default();
            if outstanding.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("continuations should be registered");
}

#[tokio::test]
async fn test_qc_skips_offline_device() {
    let oracle = StaticDeviceOracle::new().with_status(DEVICE_B, DeviceAvailability::Offline);
    let h = harness(ScriptedBackend::new(), oracle).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("QC").request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    let records = h.records(&outcome.execution_id).await;
    assert_eq!(records.len(), 4, "3 params on A plus one skip marker for B");

    let skipped: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.marker, ItemMarker::DeviceNotOnline { .. }))
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(device_of(skipped[0]), Some(DEVICE_B));
    assert_eq!(records.iter().filter(|r| r.marker.is_success()).count(), 3);

    let quantum = h.backend.submissions_of(JobKind::Quantum);
    assert_eq!(quantum.len(), 3);
    assert!(
        quantum
            .iter()
            .all(|spec| spec.device.as_ref().map(DeviceArn::as_str) == Some(DEVICE_A)),
        "nothing may be submitted to an offline device"
    );
    assert!(h.backend.submissions_of(JobKind::Classical).is_empty());

    assert_eq!(outcome.summary.total, 4);
    assert_eq!(outcome.summary.devices_not_online, 1);
    assert_eq!(h.aggregator.calls(&outcome.execution_id), 1);
}

#[tokio::test]
async fn test_absent_run_mode_runs_both_branches() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.summary.by_branch.get("cc"), Some(&3));
    assert_eq!(outcome.summary.by_branch.get("qc"), Some(&6));
    assert_eq!(outcome.summary.succeeded, 9);
    assert_eq!(h.backend.submissions_of(JobKind::Classical).len(), 3);
    assert_eq!(h.backend.submissions_of(JobKind::Quantum).len(), 6);
}

#[tokio::test]
async fn test_unknown_run_mode_falls_back_to_both() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("QUANTUM_ONLY").request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(!h.backend.submissions_of(JobKind::Classical).is_empty());
    assert!(!h.backend.submissions_of(JobKind::Quantum).is_empty());
}

#[tokio::test]
async fn test_cc_submit_error_isolated_to_its_item() {
    let backend = ScriptedBackend::new().with_rule(
        |spec| spec.kind == JobKind::Classical && spec.arg("--M") == Some("2"),
        Outcome::RejectSubmit("vcpu quota exceeded".into()),
    );
    let h = harness(backend, StaticDeviceOracle::new()).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    let records = h.records(&outcome.execution_id).await;
    assert_eq!(records.len(), 3);
    let errors: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.marker, ItemMarker::SubmitError { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].params["M"], json!(2));
    assert_eq!(outcome.summary.submit_errors, 1);
    assert_eq!(outcome.summary.succeeded, 2);
}

#[tokio::test]
async fn test_failed_and_errored_items_become_failed_markers() {
    let backend = ScriptedBackend::new()
        .with_rule(
            |spec| spec.kind == JobKind::Quantum && spec.arg("--M") == Some("1"),
            Outcome::Fail("annealing diverged".into()),
        )
        .with_rule(
            |spec| spec.kind == JobKind::Classical && spec.arg("--M") == Some("3"),
            Outcome::ExecutionError("container exited 137".into()),
        );
    let oracle = StaticDeviceOracle::new().with_status(DEVICE_B, DeviceAvailability::Offline);
    let h = harness(backend, oracle).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    // cc: 3 items, qc: 3 on A plus the skip marker for B
    assert_eq!(outcome.summary.total, 7);
    assert_eq!(outcome.summary.failed, 2);
    assert_eq!(outcome.summary.devices_not_online, 1);
    assert_eq!(outcome.summary.succeeded, 4);
}

#[tokio::test]
async fn test_model_created_before_any_job() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;

    h.orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap();

    let submissions = h.backend.submissions();
    assert_eq!(submissions[0].kind, JobKind::CreateModel);
    assert_eq!(h.backend.submissions_of(JobKind::CreateModel).len(), 1);
    let location = submissions[0]
        .arg("--model-location")
        .expect("model job carries its location")
        .to_string();
    assert!(
        submissions[1..]
            .iter()
            .all(|spec| spec.arg("--model-location") == Some(location.as_str()))
    );
}

#[tokio::test]
async fn test_model_creation_retried_once() {
    let backend = ScriptedBackend::new()
        .with_model_outcomes(vec![Outcome::Fail("image pull failed".into())]);
    let h = harness(backend, StaticDeviceOracle::new()).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(h.backend.submissions_of(JobKind::CreateModel).len(), 2);
}

#[tokio::test]
async fn test_model_creation_failure_ends_execution() {
    let backend = ScriptedBackend::new().with_model_outcomes(vec![
        Outcome::Fail("image pull failed".into()),
        Outcome::Fail("image pull failed".into()),
    ]);
    let h = harness(backend, StaticDeviceOracle::new()).await;

    let err = h
        .orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap_err();

    match err {
        WorkflowError::ModelCreationFailed { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected ModelCreationFailed, got {other}"),
    }
    assert!(h.backend.submissions_of(JobKind::Classical).is_empty());
    assert!(h.backend.submissions_of(JobKind::Quantum).is_empty());

    let sent = h.notifier.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_invalid_input_submits_nothing() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;

    let err = h
        .orchestrator
        .run(SubmissionRequest::new(json!({ "molfile": "s3://b/k" })))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::InvalidInput { .. }));
    assert_eq!(h.backend.submission_count(), 0);
    let sent = h.notifier.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
    assert!(
        sent[0]
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("molfile"))
    );
}

#[tokio::test]
async fn test_success_aggregates_and_notifies_once() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap();

    // give the failure watch a chance to (wrongly) publish
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.aggregator.calls(&outcome.execution_id), 1);
    h.notifier.assert_notification_count_eq(1);
    let sent = h.notifier.notifications();
    assert_eq!(sent[0].status, ExecutionStatus::Succeeded);
    assert_eq!(sent[0].summary.as_ref(), Some(&outcome.summary));
}

#[tokio::test]
async fn test_fan_out_width_bounds_in_flight_jobs() {
    let config = test_config().with_fan_out(FanOutConfig {
        cc_width: 2,
        device_width: 1,
        device_param_width: 3,
    });
    let backend = ScriptedBackend::new().with_latency(Duration::from_millis(20));
    let h = TestHarness::start(config, backend, StaticDeviceOracle::new())
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .run(
            ExperimentInputBuilder::new()
                .m(vec![1, 2, 3, 4, 5, 6, 7, 8])
                .request(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.summary.succeeded, 8 + 16);
    let cc_peak = h.backend.peak_in_flight(JobKind::Classical);
    let qc_peak = h.backend.peak_in_flight(JobKind::Quantum);
    assert!((1..=2).contains(&cc_peak), "cc peak was {cc_peak}");
    // one device at a time, three params per device
    assert!((1..=3).contains(&qc_peak), "qc peak was {qc_peak}");
}

#[tokio::test]
async fn test_oracle_error_counts_as_unknown() {
    let oracle = StaticDeviceOracle::new().with_error(DEVICE_B, "throttled");
    let h = harness(ScriptedBackend::new(), oracle).await;

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("QC").request())
        .await
        .unwrap();

    let records = h.records(&outcome.execution_id).await;
    let skip = records
        .iter()
        .find(|r| device_of(r) == Some(DEVICE_B))
        .expect("B should have a marker");
    match &skip.marker {
        ItemMarker::DeviceNotOnline {
            availability,
            detail,
            ..
        } => {
            assert_eq!(*availability, DeviceAvailability::Unknown);
            assert!(detail.as_deref().is_some_and(|d| d.contains("throttled")));
        }
        other => panic!("expected DeviceNotOnline, got {other:?}"),
    }
    assert_eq!(h.oracle.queries().len(), 2);
}

#[tokio::test]
async fn test_stalled_oracle_times_out_as_unknown() {
    let mut config = test_config();
    config.device_check.query_timeout_secs = 1;
    let oracle = StaticDeviceOracle::new().with_stall(DEVICE_A);
    let h = TestHarness::start(config, ScriptedBackend::new(), oracle)
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .run(
            ExperimentInputBuilder::new()
                .run_mode("QC")
                .devices(&[DEVICE_A])
                .request(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.summary.total, 1);
    assert_eq!(outcome.summary.devices_not_online, 1);
    assert!(h.backend.submissions_of(JobKind::Quantum).is_empty());
}

#[tokio::test]
async fn test_workflow_timeout_releases_continuations() {
    let config = test_config().with_workflow_timeout(Duration::from_secs(1));
    let backend =
        ScriptedBackend::new().with_rule(|spec| spec.kind == JobKind::Quantum, Outcome::Hang);
    let h = TestHarness::start(config, backend, StaticDeviceOracle::new())
        .await
        .unwrap();

    let handle = h.orchestrator.submit(
        ExperimentInputBuilder::new()
            .run_mode("QC")
            .devices(&[DEVICE_A])
            .request(),
    );
    let execution_id = handle.execution_id().clone();
    let err = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("deadline should fire")
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Timeout(_)));
    let sent = h.notifier.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, ExecutionStatus::TimedOut);
    assert_eq!(h.aggregator.calls(&execution_id), 0);

    let outstanding = h.store.outstanding(&execution_id).await.unwrap();
    assert!(outstanding.is_empty());
}

#[tokio::test]
async fn test_abort_ends_execution_as_aborted() {
    let backend =
        ScriptedBackend::new().with_rule(|spec| spec.kind == JobKind::Quantum, Outcome::Hang);
    let h = harness(backend, StaticDeviceOracle::new()).await;

    let handle = h.orchestrator.submit(
        ExperimentInputBuilder::new()
            .run_mode("QC")
            .devices(&[DEVICE_A])
            .request(),
    );
    let execution_id = handle.execution_id().clone();
    wait_for_outstanding(&h, &execution_id, 3).await;

    let abort = handle.abort_token();
    abort.abort();
    assert!(abort.is_aborted());
    let err = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("abort should end the execution")
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Aborted(_)));
    let sent = h.notifier.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, ExecutionStatus::Aborted);
    assert!(h.store.outstanding(&execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_state_sequence_for_cc_run() {
    let h = harness(ScriptedBackend::new(), StaticDeviceOracle::new()).await;
    let mut rx = h.bus.subscribe_workflow();

    let outcome = h
        .orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap();

    let mut states = Vec::new();
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        if event.execution_id() != &outcome.execution_id {
            continue;
        }
        match event.payload {
            WorkflowEventPayload::StateEntered { state } => states.push(state),
            WorkflowEventPayload::ExecutionFinished {
                status, notified, ..
            } => finished = Some((status, notified)),
            _ => {}
        }
    }

    assert_eq!(
        states,
        vec![
            WorkflowState::ValidateInput,
            WorkflowState::CreateModel,
            WorkflowState::SelectMode,
            WorkflowState::RunCc,
            WorkflowState::Aggregate,
            WorkflowState::Notify,
            WorkflowState::Done,
        ]
    );
    assert_eq!(finished, Some((ExecutionStatus::Succeeded, true)));
}

/// Resolver whose device list always fails.
struct NoDevices(ExperimentResolver);

impl ParameterResolver for NoDevices {
    fn resolve(
        &self,
        phase: &Phase,
        ctx: &ExecutionContext,
        artifact: Option<&ModelArtifact>,
    ) -> Result<Resolved, ResolveError> {
        match phase {
            Phase::QcDeviceList => Err(ResolveError::InvalidInput(
                "device catalog unavailable".into(),
            )),
            _ => self.0.resolve(phase, ctx, artifact),
        }
    }
}

#[tokio::test]
async fn test_branch_failure_fails_execution_with_one_notification() {
    let config = test_config();
    let notifier = RecordingNotifier::new();
    let backend = ScriptedBackend::new();
    let orchestrator = OrchestratorBuilder::new(config.clone())
        .with_resolver(Arc::new(NoDevices(ExperimentResolver::new(config.resolver.clone()))))
        .with_backend(Arc::new(backend.clone()))
        .with_oracle(Arc::new(StaticDeviceOracle::new()))
        .with_notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();
    let mut rx = orchestrator.bus().subscribe_terminal();

    let outcome = orchestrator
        .run(ExperimentInputBuilder::new().request())
        .await
        .unwrap();

    let finished = rx.try_recv().expect("terminal event published");
    assert!(matches!(
        finished.payload,
        WorkflowEventPayload::ExecutionFinished {
            status: ExecutionStatus::Failed,
            notified: true,
            ..
        }
    ));
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.branch_failures.len(), 1);
    assert!(outcome.branch_failures[0].contains("device catalog unavailable"));
    // the CC branch still ran to completion
    assert_eq!(outcome.summary.by_branch.get("cc"), Some(&3));

    tokio::time::sleep(Duration::from_millis(100)).await;
    notifier.assert_notification_count_eq(1);
    let sent = notifier.notifications();
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
    assert!(sent[0].summary.is_some());

    orchestrator.shutdown().await.unwrap();
}

fn orchestrator_with(config: OrchestratorConfig, backend: ScriptedBackend) -> OrchestratorBuilder {
    OrchestratorBuilder::new(config)
        .with_backend(Arc::new(backend))
        .with_oracle(Arc::new(StaticDeviceOracle::new()))
}

/// Records each notification, then takes `delay` to acknowledge it.
struct SlowAck {
    inner: RecordingNotifier,
    delay: Duration,
}

#[async_trait]
impl Notifier for SlowAck {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        self.inner.publish(notification).await?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_abort_during_notify_keeps_single_notification() {
    let notifier = RecordingNotifier::new();
    let orchestrator = orchestrator_with(test_config(), ScriptedBackend::new())
        .with_notifier(Arc::new(SlowAck {
            inner: notifier.clone(),
            delay: Duration::from_millis(300),
        }))
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let handle = orchestrator.submit(ExperimentInputBuilder::new().run_mode("CC").request());
    let sent = notifier.wait_for(1, Duration::from_secs(5)).await;
    assert_eq!(sent.len(), 1);
    handle.abort();

    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("execution should finish")
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);

    tokio::time::sleep(Duration::from_millis(100)).await;
    notifier.assert_notification_count_eq(1);
    assert_eq!(notifier.notifications()[0].status, ExecutionStatus::Succeeded);
    orchestrator.shutdown().await.unwrap();
}

/// Ledger that rejects writes: the first `fail_first` of all rows, and
/// every row whose `M` equals `reject_m`.
struct FlakyLedger {
    inner: InMemoryResultLedger,
    fail_first: usize,
    reject_m: Option<u32>,
    attempts: AtomicUsize,
}

impl FlakyLedger {
    fn new(fail_first: usize, reject_m: Option<u32>) -> Self {
        Self {
            inner: InMemoryResultLedger::new(),
            fail_first,
            reject_m,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResultSink for FlakyLedger {
    async fn record(&self, record: ResultRecord) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(anyhow!("connection reset"));
        }
        if let Some(m) = self.reject_m {
            if record.params["M"] == m {
                return Err(anyhow!("row rejected"));
            }
        }
        self.inner.record(record).await
    }

    async fn records(&self, execution_id: &ExecutionId) -> anyhow::Result<Vec<ResultRecord>> {
        self.inner.records(execution_id).await
    }
}

#[tokio::test]
async fn test_transient_ledger_failure_is_retried() {
    let ledger = Arc::new(FlakyLedger::new(1, None));
    let orchestrator = orchestrator_with(test_config(), ScriptedBackend::new())
        .with_ledger(Arc::clone(&ledger) as Arc<dyn ResultSink>)
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let outcome = orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.summary.total, 3);
    assert_eq!(ledger.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_lost_result_row_fails_execution() {
    let notifier = RecordingNotifier::new();
    let ledger = Arc::new(FlakyLedger::new(0, Some(1)));
    let backend = ScriptedBackend::new();
    let orchestrator = orchestrator_with(test_config(), backend.clone())
        .with_ledger(Arc::clone(&ledger) as Arc<dyn ResultSink>)
        .with_notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let outcome = orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap();

    assert_eq!(backend.submissions_of(JobKind::Classical).len(), 3);
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.branch_failures.len(), 1);
    assert!(outcome.branch_failures[0].contains("not written after 3 attempts"));
    // three attempts for the rejected row, one each for the others
    assert_eq!(ledger.attempts.load(Ordering::SeqCst), 5);

    tokio::time::sleep(Duration::from_millis(100)).await;
    notifier.assert_notification_count_eq(1);
    let sent = notifier.notifications();
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
    assert!(sent[0].reason.as_deref().unwrap_or_default().contains("result row"));
}

struct BrokenAggregator;

#[async_trait]
impl Aggregator for BrokenAggregator {
    async fn aggregate(&self, _execution_id: &ExecutionId) -> anyhow::Result<AggregateSummary> {
        Err(anyhow!("warehouse offline"))
    }
}

#[tokio::test]
async fn test_aggregation_failure_notified_once_by_watch() {
    let notifier = RecordingNotifier::new();
    let orchestrator = orchestrator_with(test_config(), ScriptedBackend::new())
        .with_aggregator(Arc::new(BrokenAggregator))
        .with_notifier(Arc::new(notifier.clone()))
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let err = orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Aggregation { .. }));

    let sent = notifier.wait_for(1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    notifier.assert_notification_count_eq(1);
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
    assert!(sent[0].reason.as_deref().unwrap_or_default().contains("warehouse offline"));
    assert!(sent[0].summary.is_none());
}

/// Fails its first publish, then records.
struct FailsOnce {
    inner: RecordingNotifier,
    attempts: AtomicUsize,
}

#[async_trait]
impl Notifier for FailsOnce {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow!("smtp unavailable"));
        }
        self.inner.publish(notification).await
    }
}

#[tokio::test]
async fn test_notifier_failure_gets_one_fallback_attempt() {
    let recorded = RecordingNotifier::new();
    let notifier = Arc::new(FailsOnce {
        inner: recorded.clone(),
        attempts: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator_with(test_config(), ScriptedBackend::new())
        .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let err = orchestrator
        .run(ExperimentInputBuilder::new().run_mode("CC").request())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Notification { .. }));

    let sent = recorded.wait_for(1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
    recorded.assert_notification_count_eq(1);
    assert_eq!(sent[0].status, ExecutionStatus::Failed);
    assert!(sent[0].reason.as_deref().unwrap_or_default().contains("smtp unavailable"));
}
