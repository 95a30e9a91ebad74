//! Benchmarks for fan-out and end-to-end execution throughput using criterion.
//!
//! - `fan_out` over trivial items at several widths, isolating the
//!   budget and join overhead
//! - whole executions against a zero-latency scripted backend, covering
//!   resolution, continuations, the ledger and aggregation

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use quorch::*;
use quorch_testkit::{
    ExperimentInputBuilder, ScriptedBackend, StaticDeviceOracle, TestHarness, test_config,
};

const ITEMS: usize = 1_000;

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let mut group = c.benchmark_group("fan_out");
    group.throughput(Throughput::Elements(ITEMS as u64));

    for width in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let budget = FanOutBudget::new(
                        FanOutLevel::Cc,
                        ExecutionId::new("bench"),
                        width,
                    );
                    let items: Vec<usize> = (0..ITEMS).collect();
                    let start = Instant::now();
                    let outcomes = fan_out(budget, items, |i| async move {
                        tokio::task::yield_now().await;
                        i * 2
                    })
                    .await;
                    total += start.elapsed();
                    assert_eq!(outcomes.len(), ITEMS);
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let h = rt
        .block_on(TestHarness::start(
            test_config(),
            ScriptedBackend::new(),
            StaticDeviceOracle::new(),
        ))
        .expect("harness should start");

    let mut group = c.benchmark_group("execution");
    for m in [3u32, 10, 30] {
        // cc: m params x 1 resource, qc: m params x 2 devices
        group.throughput(Throughput::Elements(u64::from(m) * 3));
        group.bench_with_input(BenchmarkId::new("params", m), &m, |b, &m| {
            let h = &h;
            b.to_async(&rt).iter(|| async move {
                let outcome = h
                    .orchestrator
                    .run(ExperimentInputBuilder::new().m((1..=m).collect()).request())
                    .await
                    .expect("execution should succeed");
                assert_eq!(outcome.summary.total, m as usize * 3);
            });
        });
    }
    group.finish();

    rt.block_on(h.orchestrator.shutdown()).expect("shutdown");
}

criterion_group!(benches, bench_fan_out, bench_execution);
criterion_main!(benches);
