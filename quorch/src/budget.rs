use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::execution::ExecutionId;
use crate::telemetry;

/// Fan-out point a budget limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FanOutLevel {
    /// CC parameter sets.
    Cc,
    /// QC devices.
    Device,
    /// QC parameter sets of one device.
    DeviceParams,
    /// Outstanding continuations awaited after a restart.
    Recovery,
}

impl FanOutLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanOutLevel::Cc => "cc",
            FanOutLevel::Device => "device",
            FanOutLevel::DeviceParams => "device_params",
            FanOutLevel::Recovery => "recovery",
        }
    }
}

impl Display for FanOutLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Concurrency limiter owned by one fan-out.
///
/// Every fan-out point gets its own budget, so nested fan-outs multiply
/// rather than share capacity. Current and peak in-flight counts are kept
/// for observability and tests.
#[derive(Debug)]
pub struct FanOutBudget {
    level: FanOutLevel,
    execution_id: ExecutionId,
    limit: usize,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Capacity held by one running item. Returned to the budget on drop.
#[derive(Debug)]
pub struct BudgetToken {
    pub level: FanOutLevel,
    pub acquired_at: DateTime<Utc>,
    budget: Arc<FanOutBudget>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BudgetToken {
    fn drop(&mut self) {
        let current = self.budget.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        telemetry::record_fanout_released(&self.budget.execution_id, self.level.as_str(), current);
    }
}

impl FanOutBudget {
    /// Create a budget of `limit` concurrent items. A zero limit is raised
    /// to one so the fan-out can always make progress.
    pub fn new(level: FanOutLevel, execution_id: ExecutionId, limit: usize) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            level,
            execution_id,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn level(&self) -> FanOutLevel {
        self.level
    }

    /// Wait for capacity and take it.
    pub async fn acquire(self: &Arc<Self>) -> anyhow::Result<BudgetToken> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .with_context(|| format!("{} fan-out budget closed", self.level))?;
        Ok(self.admit(permit))
    }

    /// Take capacity if some is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetToken> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.admit(permit))
    }

    fn admit(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> BudgetToken {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        telemetry::record_fanout_admitted(&self.execution_id, self.level.as_str(), current);
        BudgetToken {
            level: self.level,
            acquired_at: Utc::now(),
            budget: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Current utilization as `(in_flight, limit)`.
    pub fn utilization(&self) -> (usize, usize) {
        (self.in_flight.load(Ordering::SeqCst), self.limit)
    }

    pub fn has_budget(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Highest in-flight count seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: usize) -> Arc<FanOutBudget> {
        FanOutBudget::new(FanOutLevel::Cc, ExecutionId::new("exec-1"), limit)
    }

    #[tokio::test]
    async fn test_budget_limits_concurrent_tokens() {
        let budget = budget(2);
        let first = budget.acquire().await.unwrap();
        let second = budget.try_acquire();
        assert!(second.is_some());
        assert!(budget.try_acquire().is_none());
        assert!(!budget.has_budget());
        assert_eq!(budget.utilization(), (2, 2));

        drop(first);
        assert_eq!(budget.utilization(), (1, 2));
        assert!(budget.try_acquire().is_some());
        assert_eq!(budget.peak(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let budget = budget(1);
        let held = budget.acquire().await.unwrap();

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move { budget.acquire().await.map(|t| t.level) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let level = waiter.await.unwrap().unwrap();
        assert_eq!(level, FanOutLevel::Cc);
        assert_eq!(budget.peak(), 1);
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        let budget = budget(0);
        assert_eq!(budget.utilization(), (0, 1));
    }
}
