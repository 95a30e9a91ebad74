//! Tracing and telemetry instrumentation for quorch.
//!
//! Span constructors for each level of an execution, and `record_*` helpers
//! that emit a structured log event and, with the `metrics` feature, update
//! the matching Prometheus series. Every helper takes the execution id so
//! each log line can be correlated with its execution.
//!
//! # Example
//!
//! ```ignore
//! use quorch::telemetry::{execution_span, record_item_terminal};
//!
//! let span = execution_span(&execution_id, "BOTH");
//! let _enter = span.enter();
//! record_item_terminal(&execution_id, "cc", "succeeded");
//! ```

use std::time::Instant;
use tracing::{Span, info_span};

use crate::execution::ExecutionId;
use crate::job::TaskId;

/// Span covering a whole execution.
#[must_use]
pub fn execution_span(execution_id: &ExecutionId, run_mode: impl AsRef<str>) -> Span {
    info_span!(
        "quorch.execution",
        execution_id = %execution_id,
        run_mode = %run_mode.as_ref(),
    )
}

/// Span covering one fan-out.
#[must_use]
pub fn fanout_span(level: impl AsRef<str>, items: usize) -> Span {
    info_span!("quorch.fanout", level = %level.as_ref(), items = items)
}

/// Span covering one submitted job, from submit to terminal.
#[must_use]
pub fn job_span(job_id: impl AsRef<str>, kind: impl AsRef<str>) -> Span {
    info_span!(
        "quorch.job",
        job_id = %job_id.as_ref(),
        job_kind = %kind.as_ref(),
    )
}

/// Span covering the status check and dispatch of one QC device.
#[must_use]
pub fn device_span(device: impl AsRef<str>) -> Span {
    info_span!("quorch.device", device = %device.as_ref())
}

/// Span covering one continuation redemption.
#[must_use]
pub fn redeem_span(task_id: impl AsRef<str>) -> Span {
    info_span!("quorch.redeem", task_id = %task_id.as_ref())
}

/// Record the end of an execution.
pub fn record_execution_finished(
    execution_id: &ExecutionId,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        execution_id = %execution_id,
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "execution finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_execution_finished(status.as_ref());
}

/// Record the terminal marker of one item.
pub fn record_item_terminal(
    execution_id: &ExecutionId,
    branch: impl AsRef<str>,
    marker: impl AsRef<str>,
) {
    if marker.as_ref() == "succeeded" {
        tracing::debug!(
            execution_id = %execution_id,
            branch = %branch.as_ref(),
            marker = %marker.as_ref(),
            "item terminal"
        );
    } else {
        tracing::warn!(
            execution_id = %execution_id,
            branch = %branch.as_ref(),
            marker = %marker.as_ref(),
            "item terminal without success"
        );
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_item_terminal(branch.as_ref(), marker.as_ref());
}

/// Record an item taking fan-out capacity.
pub fn record_fanout_admitted(execution_id: &ExecutionId, level: &str, in_flight: usize) {
    tracing::trace!(
        execution_id = %execution_id,
        level = level,
        in_flight = in_flight,
        "fan-out item admitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_fanout_inflight(level, 1.0);
}

/// Record an item returning fan-out capacity.
pub fn record_fanout_released(execution_id: &ExecutionId, level: &str, in_flight: usize) {
    tracing::trace!(
        execution_id = %execution_id,
        level = level,
        in_flight = in_flight,
        "fan-out item released"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_fanout_inflight(level, -1.0);
}

/// Record a continuation redemption.
pub fn record_continuation_redeemed(execution_id: &ExecutionId, task_id: &TaskId, succeeded: bool) {
    tracing::info!(
        execution_id = %execution_id,
        task_id = %task_id,
        succeeded = succeeded,
        "continuation redeemed"
    );
}

/// Update the pending-continuations gauge.
pub fn set_pending_continuations(pending: usize) {
    tracing::debug!(pending = pending, "pending continuations updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_continuations_pending(pending as f64);
}

/// Observe the duration of one job, from submit to terminal.
pub fn observe_job_duration(
    execution_id: &ExecutionId,
    kind: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        execution_id = %execution_id,
        job_kind = %kind.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(kind.as_ref(), status.as_ref(), duration_secs);
}

/// Start timing a job. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Stop timing a job and observe its duration.
pub fn record_job_end(
    handle: JobTimingHandle,
    execution_id: &ExecutionId,
    kind: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    observe_job_duration(execution_id, kind, status, handle.start.elapsed().as_secs_f64());
}

/// Opaque timing handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_span_name(span: Span, expected: &str) {
        // Spans built without an active subscriber may carry no metadata.
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), expected);
        }
    }

    #[test]
    fn test_span_names() {
        let execution_id = ExecutionId::new("exec-1");
        assert_span_name(execution_span(&execution_id, "BOTH"), "quorch.execution");
        assert_span_name(fanout_span("cc", 4), "quorch.fanout");
        assert_span_name(job_span("job-1", "classical"), "quorch.job");
        assert_span_name(device_span("Advantage_system4"), "quorch.device");
        assert_span_name(redeem_span("task-1"), "quorch.redeem");
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);
        record_job_end(handle, &ExecutionId::new("exec-1"), "cc", "succeeded");
    }
}
