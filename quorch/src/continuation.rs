use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ContinuationError;
use crate::execution::ExecutionId;
use crate::job::{JobSpec, TaskId, TerminalStatus};

/// Opaque handle naming one suspension point of an execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken(pub Uuid);

impl Default for ContinuationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted pairing of a token with the work item waiting on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContinuationRecord {
    pub token: ContinuationToken,
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    /// The outstanding work item, kept whole so a restarted orchestrator can
    /// record its result without re-resolving parameters.
    pub spec: JobSpec,
    pub registered_at: DateTime<Utc>,
}

impl ContinuationRecord {
    pub fn for_spec(spec: &JobSpec) -> Self {
        Self {
            token: ContinuationToken::new(),
            task_id: spec.task_id.clone(),
            execution_id: spec.execution_id.clone(),
            spec: spec.clone(),
            registered_at: Utc::now(),
        }
    }
}

/// Durable storage for continuation records.
///
/// Implementations must make `register` safe under concurrent inserts and
/// `redeem` an atomic pending-to-redeemed transition, so a task can be
/// redeemed at most once.
#[async_trait]
pub trait ContinuationStore: Send + Sync {
    /// Persist a new pending continuation.
    async fn register(&self, record: ContinuationRecord) -> Result<(), ContinuationError>;

    /// Mark the continuation for `task_id` as redeemed with `status`.
    ///
    /// Fails with [`ContinuationError::AlreadyRedeemed`] on a second
    /// redemption and [`ContinuationError::UnknownTask`] when nothing is
    /// registered for the task.
    async fn redeem(
        &self,
        task_id: &TaskId,
        status: TerminalStatus,
    ) -> Result<ContinuationRecord, ContinuationError>;

    /// Remove a redeemed continuation and return its status.
    ///
    /// Returns `None` while the continuation is still pending.
    async fn take_redeemed(
        &self,
        token: &ContinuationToken,
    ) -> Result<Option<TerminalStatus>, ContinuationError>;

    /// Drop a continuation whose submission never happened.
    async fn cancel(&self, token: &ContinuationToken) -> Result<(), ContinuationError>;

    /// Continuations of an execution not yet consumed, pending or redeemed.
    async fn outstanding(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ContinuationRecord>, ContinuationError>;

    /// Number of continuations still waiting for redemption.
    async fn pending_count(&self) -> Result<usize, ContinuationError>;
}

#[derive(Debug)]
enum Slot {
    Pending,
    Redeemed(TerminalStatus),
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<ContinuationToken, (ContinuationRecord, Slot)>,
    by_task: HashMap<TaskId, ContinuationToken>,
}

/// Process-local continuation store.
///
/// Thread-safe via `tokio::sync::Mutex`; it does not survive a restart, use
/// the Postgres store for that.
#[derive(Clone, Default, Debug)]
pub struct InMemoryContinuationStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuationStore for InMemoryContinuationStore {
    async fn register(&self, record: ContinuationRecord) -> Result<(), ContinuationError> {
        let mut guard = self.inner.lock().await;
        if guard.by_task.contains_key(&record.task_id)
            || guard.records.contains_key(&record.token)
        {
            return Err(ContinuationError::DuplicateRegistration(
                record.task_id,
            ));
        }
        guard.by_task.insert(record.task_id.clone(), record.token);
        guard.records.insert(record.token, (record, Slot::Pending));
        Ok(())
    }

    async fn redeem(
        &self,
        task_id: &TaskId,
        status: TerminalStatus,
    ) -> Result<ContinuationRecord, ContinuationError> {
        let mut guard = self.inner.lock().await;
        let token = guard
            .by_task
            .get(task_id)
            .copied()
            .ok_or_else(|| ContinuationError::UnknownTask(task_id.clone()))?;
        let (record, slot) = guard
            .records
            .get_mut(&token)
            .ok_or_else(|| ContinuationError::UnknownTask(task_id.clone()))?;
        match slot {
            Slot::Pending => {
                *slot = Slot::Redeemed(status);
                Ok(record.clone())
            }
            Slot::Redeemed(_) => {
                Err(ContinuationError::AlreadyRedeemed(task_id.clone()))
            }
        }
    }

    async fn take_redeemed(
        &self,
        token: &ContinuationToken,
    ) -> Result<Option<TerminalStatus>, ContinuationError> {
        let mut guard = self.inner.lock().await;
        let redeemed = matches!(
            guard.records.get(token),
            Some((_, Slot::Redeemed(_)))
        );
        if !redeemed {
            return Ok(None);
        }
        match guard.records.remove(token) {
            Some((record, Slot::Redeemed(status))) => {
                guard.by_task.remove(&record.task_id);
                Ok(Some(status))
            }
            _ => Ok(None),
        }
    }

    async fn cancel(&self, token: &ContinuationToken) -> Result<(), ContinuationError> {
        let mut guard = self.inner.lock().await;
        if let Some((record, _)) = guard.records.remove(token) {
            guard.by_task.remove(&record.task_id);
        }
        Ok(())
    }

    async fn outstanding(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ContinuationRecord>, ContinuationError> {
        let guard = self.inner.lock().await;
        let mut records: Vec<ContinuationRecord> = guard
            .records
            .values()
            .filter(|(record, _)| &record.execution_id == execution_id)
            .map(|(record, _)| record.clone())
            .collect();
        records.sort_by_key(|record| record.registered_at);
        Ok(records)
    }

    async fn pending_count(&self) -> Result<usize, ContinuationError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .records
            .values()
            .filter(|(_, slot)| matches!(slot, Slot::Pending))
            .count())
    }
}

/// Suspend/redeem channel layered over a [`ContinuationStore`].
///
/// Suspended items park on a per-token [`Notify`]; a redemption flips the
/// stored state and wakes the waiter. When the store is shared between
/// processes, a redemption may land in another process, so waiters also
/// re-check the store every `poll_interval` if one is configured.
#[derive(Clone)]
pub struct ContinuationHub {
    store: Arc<dyn ContinuationStore>,
    wakers: Arc<Mutex<HashMap<ContinuationToken, Arc<Notify>>>>,
    poll_interval: Option<Duration>,
}

impl std::fmt::Debug for ContinuationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let waiters = self
            .wakers
            .try_lock()
            .map(|wakers| wakers.len())
            .unwrap_or_default();
        f.debug_struct("ContinuationHub")
            .field("waiters", &waiters)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ContinuationHub {
    pub fn new(store: Arc<dyn ContinuationStore>) -> Self {
        Self {
            store,
            wakers: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: None,
        }
    }

    /// Re-check the store on this interval while suspended.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn store(&self) -> Arc<dyn ContinuationStore> {
        Arc::clone(&self.store)
    }

    async fn waker(&self, token: ContinuationToken) -> Arc<Notify> {
        let mut guard = self.wakers.lock().await;
        Arc::clone(guard.entry(token).or_insert_with(|| Arc::new(Notify::new())))
    }

    /// Persist a continuation before its task is submitted.
    pub async fn register(
        &self,
        record: ContinuationRecord,
    ) -> Result<ContinuationToken, ContinuationError> {
        let token = record.token;
        self.waker(token).await;
        if let Err(err) = self.store.register(record).await {
            self.wakers.lock().await.remove(&token);
            return Err(err);
        }
        Ok(token)
    }

    /// Suspend until the continuation is redeemed, then consume it.
    ///
    /// There is no timeout here; an execution-level deadline bounds the wait.
    pub async fn await_redemption(
        &self,
        token: &ContinuationToken,
    ) -> Result<TerminalStatus, ContinuationError> {
        let notify = self.waker(*token).await;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(status) = self.store.take_redeemed(token).await? {
                self.wakers.lock().await.remove(token);
                return Ok(status);
            }

            match self.poll_interval {
                Some(interval) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Redeem the continuation registered for `task_id`.
    pub async fn redeem(
        &self,
        task_id: &TaskId,
        status: TerminalStatus,
    ) -> Result<ContinuationRecord, ContinuationError> {
        let record = match self.store.redeem(task_id, status).await {
            Ok(record) => record,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "continuation redemption rejected");
                return Err(err);
            }
        };
        let waker = self.wakers.lock().await.get(&record.token).cloned();
        match waker {
            Some(notify) => notify.notify_one(),
            None => debug!(
                task_id = %task_id,
                token = %record.token,
                "redeemed continuation has no local waiter"
            ),
        }
        Ok(record)
    }

    /// Drop a registration whose task could not be submitted.
    pub async fn cancel(&self, token: &ContinuationToken) -> Result<(), ContinuationError> {
        self.wakers.lock().await.remove(token);
        self.store.cancel(token).await
    }
}
