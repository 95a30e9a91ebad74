//! Continuation redemption and restart recovery.
//!
//! A redemption must land at most once, and an execution whose quantum items
//! were suspended by one orchestrator must be finishable by another that
//! shares the continuation store.

use std::sync::Arc;
use std::time::Duration;

use quorch::runtime::ShutdownToken;
use quorch::*;
use quorch_testkit::{
    DEVICE_A, ExperimentInputBuilder, Outcome, ScriptedBackend, StaticDeviceOracle, TestHarness,
    test_config,
};
use serde_json::json;
use tokio::time::timeout;

fn quantum_spec(execution_id: &str) -> JobSpec {
    JobSpec::new(
        ExecutionId::new(execution_id),
        JobKind::Quantum,
        ComputeShape::new(2, 2),
        vec!["--M".into(), "1".into()],
    )
    .with_device(DeviceArn::from(DEVICE_A))
    .with_params(json!({"M": 1, "D": 4, "A": 300, "HQ": 200}))
}

#[tokio::test]
async fn test_second_terminal_event_is_rejected() {
    let bus = Arc::new(InProcEventBus::new(64));
    let hub = ContinuationHub::new(Arc::new(InMemoryContinuationStore::new()));
    let listener = TaskEventListener::new(hub.clone(), Arc::clone(&bus));

    let spec = quantum_spec("exec-dup");
    let token = hub.register(ContinuationRecord::for_spec(&spec)).await.unwrap();

    let running = TaskStateChange::new(spec.task_id.clone(), TaskState::Running);
    assert!(listener.handle(&running).await.unwrap().is_none());

    let completed = TaskStateChange::new(spec.task_id.clone(), TaskState::Completed);
    let record = listener.handle(&completed).await.unwrap().unwrap();
    assert_eq!(record.token, token);

    let failed = TaskStateChange::new(spec.task_id.clone(), TaskState::Failed).with_reason("late");
    let err = listener.handle(&failed).await.unwrap_err();
    assert!(matches!(err, ContinuationError::AlreadyRedeemed(_)));

    // the first terminal state wins
    let status = hub.await_redemption(&token).await.unwrap();
    assert_eq!(status, TerminalStatus::Succeeded);
}

#[tokio::test]
async fn test_event_for_unregistered_task_is_ignored_by_listener() {
    let bus = Arc::new(InProcEventBus::new(64));
    let hub = ContinuationHub::new(Arc::new(InMemoryContinuationStore::new()));
    let shutdown = ShutdownToken::new();
    let handle = TaskEventListener::new(hub.clone(), Arc::clone(&bus)).spawn(shutdown.clone());

    bus.publish_task(TaskStateChange::new(TaskId::new("stray"), TaskState::Completed));

    // the listener keeps serving after a stray event
    let spec = quantum_spec("exec-stray");
    let token = hub.register(ContinuationRecord::for_spec(&spec)).await.unwrap();
    bus.publish_task(TaskStateChange::new(spec.task_id.clone(), TaskState::Completed));
    let status = timeout(Duration::from_secs(2), hub.await_redemption(&token))
        .await
        .expect("redemption should arrive")
        .unwrap();
    assert!(status.is_success());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_event_after_run_adds_no_row() {
    let h = TestHarness::start(test_config(), ScriptedBackend::new(), StaticDeviceOracle::new())
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
    let before = h.records(&outcome.execution_id).await;
    assert_eq!(before.len(), 3);

    let replayed = before[0].task_id.clone().expect("qc rows carry a task id");
    h.bus
        .publish_task(TaskStateChange::new(replayed, TaskState::Failed).with_reason("replay"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = h.records(&outcome.execution_id).await;
    assert_eq!(after.len(), 3);
    assert!(after.iter().all(|r| r.marker.is_success()));
}

#[tokio::test]
async fn test_resume_finishes_execution_from_shared_store() {
    let store = Arc::new(InMemoryContinuationStore::new());
    let hanging =
        ScriptedBackend::new().with_rule(|spec| spec.kind == JobKind::Quantum, Outcome::Hang);
    let first = TestHarness::start_with_store(
        test_config(),
        hanging,
        StaticDeviceOracle::new(),
        Arc::clone(&store),
    )
    .await
    .unwrap();

    let request = ExperimentInputBuilder::new()
        .run_mode("QC")
        .devices(&[DEVICE_A])
        .m(vec![1, 2])
        .request()
        .with_execution_id("exec-resume");
    let execution_id = ExecutionId::new("exec-resume");
    let _suspended = first.orchestrator.submit(request.clone());

    let outstanding = timeout(Duration::from_secs(5), async {
        loop {
            let records = store.outstanding(&execution_id).await.unwrap();
            if records.len() == 2 {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both items should suspend");
    first.orchestrator.shutdown().await.unwrap();

    // a new process picks up the same store
    let second = TestHarness::start_with_store(
        test_config(),
        ScriptedBackend::new(),
        StaticDeviceOracle::new(),
        Arc::clone(&store),
    )
    .await
    .unwrap();
    let handle = second
        .orchestrator
        .resume(ExecutionContext::from_request(request));

    second.bus.publish_task(TaskStateChange::new(
        outstanding[0].task_id.clone(),
        TaskState::Completed,
    ));
    second.bus.publish_task(
        TaskStateChange::new(outstanding[1].task_id.clone(), TaskState::Failed)
            .with_reason("qpu calibration"),
    );

    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("resumed execution should finish")
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(second.aggregator.calls(&execution_id), 1);
    second.notifier.assert_notification_count_eq(1);
    // nothing was re-submitted
    assert_eq!(second.backend.submission_count(), 0);
    assert!(store.outstanding(&execution_id).await.unwrap().is_empty());
}
