use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::execution::{ExecutionContext, ExecutionId};
use crate::ledger::{ItemMarker, ResultRecord, ResultSink};

/// Roll-up of every terminal item of an execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub execution_id: Option<ExecutionId>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub submit_errors: usize,
    pub devices_not_online: usize,
    /// Item count per branch label.
    pub by_branch: BTreeMap<String, usize>,
}

impl AggregateSummary {
    pub fn from_records(execution_id: &ExecutionId, records: &[ResultRecord]) -> Self {
        let mut summary = Self {
            execution_id: Some(execution_id.clone()),
            ..Self::default()
        };
        for record in records {
            summary.total += 1;
            *summary
                .by_branch
                .entry(record.branch.as_str().to_string())
                .or_default() += 1;
            match &record.marker {
                ItemMarker::Succeeded => summary.succeeded += 1,
                ItemMarker::Failed { .. } => summary.failed += 1,
                ItemMarker::SubmitError { .. } => summary.submit_errors += 1,
                ItemMarker::DeviceNotOnline { .. } => summary.devices_not_online += 1,
            }
        }
        summary
    }
}

/// Rolls up the result rows of one execution.
///
/// Called exactly once per execution, after every branch is terminal.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, execution_id: &ExecutionId) -> anyhow::Result<AggregateSummary>;
}

/// [`Aggregator`] that summarizes the rows of a [`ResultSink`].
#[derive(Clone)]
pub struct LedgerAggregator {
    ledger: Arc<dyn ResultSink>,
}

impl std::fmt::Debug for LedgerAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAggregator").finish_non_exhaustive()
    }
}

impl LedgerAggregator {
    pub fn new(ledger: Arc<dyn ResultSink>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Aggregator for LedgerAggregator {
    async fn aggregate(&self, execution_id: &ExecutionId) -> anyhow::Result<AggregateSummary> {
        let records = self.ledger.records(execution_id).await?;
        Ok(AggregateSummary::from_records(execution_id, &records))
    }
}

/// An execution as archived after aggregation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedExecution {
    pub context: ExecutionContext,
    pub summary: AggregateSummary,
    pub archived_at: DateTime<Utc>,
}

/// Long-term storage for finished execution contexts.
#[async_trait]
pub trait ContextArchive: Send + Sync {
    async fn archive(
        &self,
        context: &ExecutionContext,
        summary: &AggregateSummary,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Default, Debug)]
pub struct InMemoryContextArchive {
    entries: Arc<Mutex<HashMap<ExecutionId, ArchivedExecution>>>,
}

impl InMemoryContextArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, execution_id: &ExecutionId) -> Option<ArchivedExecution> {
        self.entries.lock().await.get(execution_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl ContextArchive for InMemoryContextArchive {
    async fn archive(
        &self,
        context: &ExecutionContext,
        summary: &AggregateSummary,
    ) -> anyhow::Result<()> {
        let entry = ArchivedExecution {
            context: context.clone(),
            summary: summary.clone(),
            archived_at: Utc::now(),
        };
        self.entries
            .lock()
            .await
            .insert(context.execution_id.clone(), entry);
        Ok(())
    }
}
