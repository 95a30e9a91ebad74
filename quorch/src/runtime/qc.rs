use tracing::{Instrument, debug, error, info, warn};

use crate::backend::DeviceAvailability;
use crate::budget::{FanOutBudget, FanOutLevel};
use crate::continuation::ContinuationRecord;
use crate::events::WorkflowEventPayload;
use crate::execution::{ExecutionContext, ModelArtifact};
use crate::fanout::fan_out;
use crate::job::{DeviceArn, JobSpec};
use crate::ledger::{Branch, ItemMarker, ResultRecord};
use crate::resolver::Phase;
use crate::telemetry;

use super::orchestrator::{BranchReport, Services};

/// Run the quantum branch: fan out over devices, then over the parameter
/// sets of each online device.
pub(crate) async fn run(
    services: &Services,
    context: &ExecutionContext,
    artifact: &ModelArtifact,
) -> BranchReport {
    let execution_id = &context.execution_id;
    services.publish(
        execution_id,
        WorkflowEventPayload::BranchDispatched { branch: Branch::Qc },
    );

    let phase = Phase::QcDeviceList;
    let devices = match services
        .resolver
        .resolve(&phase, context, Some(artifact))
        .and_then(|resolved| resolved.into_devices(&phase))
    {
        Ok(devices) => devices,
        Err(err) => {
            error!(execution_id = %execution_id, error = %err, "QC device resolution failed");
            services.publish(
                execution_id,
                WorkflowEventPayload::BranchFinished {
                    branch: Branch::Qc,
                    items: 0,
                },
            );
            return BranchReport::failed(format!("qc: {err}"));
        }
    };

    info!(execution_id = %execution_id, devices = devices.len(), "dispatching QC devices");
    let budget = FanOutBudget::new(
        FanOutLevel::Device,
        execution_id.clone(),
        services.config.fan_out.device_width,
    );
    let pending = devices.clone();
    let task_services = services.clone();
    let task_context = context.clone();
    let task_artifact = artifact.clone();
    let outcomes = fan_out(budget, devices, move |device: DeviceArn| {
        let services = task_services.clone();
        let context = task_context.clone();
        let artifact = task_artifact.clone();
        async move { run_device(&services, &context, &artifact, device).await }
    })
    .await;

    let mut report = BranchReport::default();
    for outcome in outcomes {
        match outcome {
            Ok(device_report) => {
                report.items += device_report.items;
                report.failures.extend(device_report.failures);
            }
            Err(lost) => {
                let device = pending
                    .get(lost.index)
                    .map(DeviceArn::to_string)
                    .unwrap_or_default();
                report
                    .failures
                    .push(format!("qc device {device}: {}", lost.reason));
            }
        }
    }

    services.publish(
        execution_id,
        WorkflowEventPayload::BranchFinished {
            branch: Branch::Qc,
            items: report.items,
        },
    );
    report
}

async fn run_device(
    services: &Services,
    context: &ExecutionContext,
    artifact: &ModelArtifact,
    device: DeviceArn,
) -> BranchReport {
    let span = telemetry::device_span(device.as_str());
    async {
        let execution_id = &context.execution_id;
        let (availability, detail) = check_device(services, &device).await;
        if !availability.is_online() {
            info!(
                execution_id = %execution_id,
                device = %device,
                availability = %availability,
                "device not online; skipping"
            );
            services.publish(
                execution_id,
                WorkflowEventPayload::DeviceSkipped {
                    device: device.clone(),
                    availability,
                },
            );
            let failures = services
                .record_item(ResultRecord::device_skipped(
                    execution_id,
                    &device,
                    availability,
                    detail,
                ))
                .await
                .err()
                .map(|reason| format!("qc: {reason}"))
                .into_iter()
                .collect();
            return BranchReport { items: 1, failures };
        }

        let phase = Phase::ParamsForQcDevice(device.clone());
        let jobs = match services
            .resolver
            .resolve(&phase, context, Some(artifact))
            .and_then(|resolved| resolved.into_jobs(&phase))
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(
                    execution_id = %execution_id,
                    device = %device,
                    error = %err,
                    "QC parameter resolution failed"
                );
                return BranchReport::failed(format!("qc device {device}: {err}"));
            }
        };

        let items = jobs.len();
        let budget = FanOutBudget::new(
            FanOutLevel::DeviceParams,
            execution_id.clone(),
            services.config.fan_out.device_param_width,
        );
        let specs = jobs.clone();
        let task_services = services.clone();
        let outcomes = fan_out(budget, jobs, move |spec: JobSpec| {
            let services = task_services.clone();
            async move { run_item(&services, spec).await }
        })
        .await;
        let failures = services.settle_items(Branch::Qc, &specs, outcomes).await;
        BranchReport { items, failures }
    }
    .instrument(span)
    .await
}

/// Query the oracle once. Errors and slow answers count as UNKNOWN.
async fn check_device(
    services: &Services,
    device: &DeviceArn,
) -> (DeviceAvailability, Option<String>) {
    let timeout = services.config.device_check.query_timeout();
    match tokio::time::timeout(timeout, services.oracle.status(device)).await {
        Ok(Ok(availability)) => (availability, None),
        Ok(Err(err)) => {
            warn!(device = %device, error = %err, "device status query failed");
            (DeviceAvailability::Unknown, Some(err.to_string()))
        }
        Err(_) => {
            warn!(device = %device, timeout_secs = timeout.as_secs(), "device status query timed out");
            (
                DeviceAvailability::Unknown,
                Some(format!(
                    "status query timed out after {}s",
                    timeout.as_secs()
                )),
            )
        }
    }
}

/// Register a continuation, start the task, and suspend until the
/// task-event listener redeems it.
async fn run_item(services: &Services, spec: JobSpec) -> Result<(), String> {
    let span = telemetry::job_span(spec.job_id.to_string(), spec.kind.as_str());
    async {
        let timing = telemetry::record_job_start(spec.job_id.to_string());
        let marker = suspend_on_task(services, &spec).await;
        let status = if marker.is_success() { "succeeded" } else { "failed" };
        telemetry::record_job_end(timing, &spec.execution_id, spec.kind.as_str(), status);
        services
            .record_item(ResultRecord::for_spec(&spec, Branch::Qc, marker))
            .await
    }
    .instrument(span)
    .await
}

async fn suspend_on_task(services: &Services, spec: &JobSpec) -> ItemMarker {
    let execution_id = &spec.execution_id;
    // Registered before submission so an early completion event finds it.
    let token = match services
        .hub
        .register(ContinuationRecord::for_spec(spec))
        .await
    {
        Ok(token) => token,
        Err(err) => {
            error!(
                execution_id = %execution_id,
                task_id = %spec.task_id,
                error = %err,
                "continuation registration failed"
            );
            return ItemMarker::SubmitError {
                reason: format!("continuation registration failed: {err}"),
            };
        }
    };

    match services.runner.start(spec).await {
        Ok(handle) => {
            debug!(
                execution_id = %execution_id,
                task_id = %spec.task_id,
                backend_id = %handle.backend_id,
                "task started; suspending"
            );
        }
        Err(err) => {
            if let Err(cancel_err) = services.hub.cancel(&token).await {
                warn!(
                    execution_id = %execution_id,
                    task_id = %spec.task_id,
                    error = %cancel_err,
                    "could not release continuation of unsubmitted task"
                );
            }
            return ItemMarker::from(err);
        }
    }

    services.publish(
        execution_id,
        WorkflowEventPayload::TaskSuspended {
            task_id: spec.task_id.clone(),
            token,
        },
    );
    if let Ok(pending) = services.hub.store().pending_count().await {
        telemetry::set_pending_continuations(pending);
    }

    match services.hub.await_redemption(&token).await {
        Ok(status) => ItemMarker::from(status),
        Err(err) => ItemMarker::Failed {
            reason: format!("continuation lost: {err}"),
        },
    }
}
