//! Integration tests for the Postgres continuation store.
//!
//! Requires a running Postgres instance; the schema is created on demand.
//! Run with: `cargo test --test postgres_continuations --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::collections::HashSet;

use quorch::persistence::PostgresContinuationStore;
use quorch::*;
use serde_json::json;

async fn store() -> PostgresContinuationStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let store = PostgresContinuationStore::connect(&PersistenceConfig::new(url))
        .await
        .expect("connect");
    store.ensure_schema().await.expect("schema");
    store
}

fn record(execution_id: &ExecutionId) -> ContinuationRecord {
    let spec = JobSpec::new(
        execution_id.clone(),
        JobKind::Quantum,
        ComputeShape::new(2, 2),
        vec!["--M".into(), "1".into()],
    )
    .with_device(DeviceArn::from("arn:aws:braket:::device/qpu/d-wave/DW_2000Q_6"))
    .with_params(json!({"M": 1, "D": 4}));
    ContinuationRecord::for_spec(&spec)
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn test_redeem_is_at_most_once() {
    let store = store().await;
    let execution_id = ExecutionId::generate();
    let record = record(&execution_id);
    let task_id = record.task_id.clone();
    let token = record.token;

    store.register(record).await.unwrap();
    assert!(store.take_redeemed(&token).await.unwrap().is_none());

    let failed = TerminalStatus::Failed {
        reason: "qpu offline".into(),
    };
    let redeemed = store.redeem(&task_id, failed.clone()).await.unwrap();
    assert_eq!(redeemed.token, token);
    assert_eq!(redeemed.spec.params["M"], json!(1));

    let second = store.redeem(&task_id, TerminalStatus::Succeeded).await;
    assert!(matches!(second, Err(ContinuationError::AlreadyRedeemed(_))));

    assert_eq!(store.take_redeemed(&token).await.unwrap(), Some(failed));
    assert!(store.outstanding(&execution_id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn test_duplicate_registration_and_outstanding() {
    let store = store().await;
    let execution_id = ExecutionId::generate();
    let first = record(&execution_id);
    let mut clash = record(&execution_id);
    clash.task_id = first.task_id.clone();
    let second = record(&execution_id);

    store.register(first.clone()).await.unwrap();
    let err = store.register(clash).await.unwrap_err();
    assert!(matches!(err, ContinuationError::DuplicateRegistration(_)));
    store.register(second.clone()).await.unwrap();

    let outstanding = store.outstanding(&execution_id).await.unwrap();
    let tokens: HashSet<_> = outstanding.iter().map(|r| r.token).collect();
    assert_eq!(tokens, HashSet::from([first.token, second.token]));

    store.cancel(&first.token).await.unwrap();
    store.cancel(&second.token).await.unwrap();
    assert!(store.outstanding(&execution_id).await.unwrap().is_empty());

    let unknown = store.redeem(&first.task_id, TerminalStatus::Succeeded).await;
    assert!(matches!(unknown, Err(ContinuationError::UnknownTask(_))));
}
