//! Bounded-concurrency map combinator.
//!
//! [`fan_out`] runs one task per item with at most `limit` in flight and
//! returns one outcome per item, in input order. An item that errors is the
//! closure's business: it should fold the error into its output. An item
//! that panics is caught here and reported as [`ItemPanicked`], so a single
//! bad item never takes the other items down with it.
//!
//! Dropping the returned future aborts every spawned item.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{Instrument, error};

use crate::budget::FanOutBudget;
use crate::telemetry;

/// An item whose task panicked or was cancelled.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("fan-out item {index} did not complete: {reason}")]
pub struct ItemPanicked {
    pub index: usize,
    pub reason: String,
}

/// Map `items` through `f` with the concurrency of `budget`.
pub async fn fan_out<T, R, F, Fut>(
    budget: Arc<FanOutBudget>,
    items: Vec<T>,
    f: F,
) -> Vec<Result<R, ItemPanicked>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let span = telemetry::fanout_span(budget.level().as_str(), total);
    async move {
        let f = Arc::new(f);
        let mut tasks = JoinSet::new();
        let mut ids = std::collections::HashMap::with_capacity(total);

        for (index, item) in items.into_iter().enumerate() {
            let token = match budget.acquire().await {
                Ok(token) => token,
                Err(err) => {
                    error!(index, error = %err, "fan-out budget unavailable");
                    break;
                }
            };
            let f = Arc::clone(&f);
            let handle = tasks.spawn(
                async move {
                    let output = f(item).await;
                    drop(token);
                    (index, output)
                }
                .in_current_span(),
            );
            ids.insert(handle.id(), index);
        }

        let mut results: Vec<Option<Result<R, ItemPanicked>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (index, output))) => results[index] = Some(Ok(output)),
                Err(err) => {
                    let index = ids.get(&err.id()).copied().unwrap_or_default();
                    let reason = if err.is_panic() {
                        "item task panicked".to_string()
                    } else {
                        "item task was cancelled".to_string()
                    };
                    error!(index, reason = %reason, "fan-out item lost");
                    results[index] = Some(Err(ItemPanicked { index, reason }));
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(ItemPanicked {
                        index,
                        reason: "item was never started".to_string(),
                    })
                })
            })
            .collect()
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::FanOutLevel;
    use crate::execution::ExecutionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn budget(limit: usize) -> Arc<FanOutBudget> {
        FanOutBudget::new(FanOutLevel::Cc, ExecutionId::new("exec-1"), limit)
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let results = fan_out(budget(3), vec![30u64, 10, 20, 0], |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay * 2
        })
        .await;
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![60, 20, 40, 0]);
    }

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let budget = budget(4);

        let results = {
            let active = active.clone();
            let peak = peak.clone();
            fan_out(budget.clone(), (0..25).collect::<Vec<_>>(), move |i| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .await
        };

        assert_eq!(results.len(), 25);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(budget.peak() <= 4);
        assert_eq!(budget.utilization(), (0, 4));
    }

    #[tokio::test]
    async fn test_panicking_item_is_isolated() {
        let results = fan_out(budget(2), vec![1, 2, 3], |i| async move {
            if i == 2 {
                panic!("boom");
            }
            i
        })
        .await;

        assert_eq!(results[0], Ok(1));
        assert!(matches!(&results[1], Err(ItemPanicked { index: 1, .. })));
        assert_eq!(results[2], Ok(3));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = fan_out(budget(2), Vec::<u8>::new(), |i| async move { i }).await;
        assert!(results.is_empty());
    }
}
