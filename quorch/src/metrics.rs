//! Prometheus metrics instrumentation for quorch.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `quorch_executions_total` - Executions that reached a terminal status
//! - `quorch_items_total` - Fan-out items by branch and terminal marker
//!
//! ## Gauges
//! - `quorch_fanout_inflight` - Items currently holding fan-out capacity
//! - `quorch_continuations_pending` - Registered continuations not yet redeemed
//!
//! ## Histograms
//! - `quorch_job_duration_seconds` - Submit-to-terminal duration of backend jobs
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for quorch metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `status`: SUCCEEDED, FAILED, TIMED_OUT or ABORTED
pub static EXECUTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "quorch_executions_total",
        "Total number of executions that reached a terminal status",
    );
    CounterVec::new(opts, &["status"]).expect("quorch_executions_total metric creation failed")
});

/// Labels:
/// - `branch`: cc or qc
/// - `marker`: succeeded, failed, submit_error, device_not_online
pub static ITEMS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quorch_items_total", "Total number of fan-out items recorded");
    CounterVec::new(opts, &["branch", "marker"]).expect("quorch_items_total metric creation failed")
});

/// Labels:
/// - `level`: cc, device, device_params or recovery
pub static FANOUT_INFLIGHT: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "quorch_fanout_inflight",
        "Items currently holding fan-out capacity",
    );
    GaugeVec::new(opts, &["level"]).expect("quorch_fanout_inflight metric creation failed")
});

pub static CONTINUATIONS_PENDING: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "quorch_continuations_pending",
        "Registered continuations not yet redeemed",
    )
    .expect("quorch_continuations_pending metric creation failed")
});

/// Labels:
/// - `job_kind`: create_model, classical or quantum
/// - `status`: succeeded or failed
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // Quantum tasks can queue for hours.
    let buckets = exponential_buckets(0.01, 2.0, 24).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "quorch_job_duration_seconds",
        "Submit-to-terminal duration of backend jobs in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_kind", "status"])
        .expect("quorch_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EXECUTIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ITEMS_TOTAL.clone()),
        Box::new(FANOUT_INFLIGHT.clone()),
        Box::new(CONTINUATIONS_PENDING.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_execution_finished(status: &str) {
    EXECUTIONS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_item_terminal(branch: &str, marker: &str) {
    ITEMS_TOTAL.with_label_values(&[branch, marker]).inc();
}

/// Move the in-flight gauge of `level` by `delta`.
pub fn adjust_fanout_inflight(level: &str, delta: f64) {
    FANOUT_INFLIGHT.with_label_values(&[level]).add(delta);
}

pub fn set_continuations_pending(pending: f64) {
    CONTINUATIONS_PENDING.set(pending);
}

pub fn observe_job_duration(job_kind: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_fanout_gauge_moves_both_ways() {
        adjust_fanout_inflight("test_level", 1.0);
        adjust_fanout_inflight("test_level", 1.0);
        adjust_fanout_inflight("test_level", -1.0);
        assert_eq!(FANOUT_INFLIGHT.with_label_values(&["test_level"]).get(), 1.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_execution_finished("SUCCEEDED");
        record_item_terminal("qc", "device_not_online");
        observe_job_duration("quantum", "succeeded", 42.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("quorch_executions_total"));
        assert!(output.contains("quorch_items_total"));
        assert!(output.contains("quorch_job_duration_seconds"));
    }
}
