use tracing::{Instrument, error, info};

use crate::backend::submit_and_wait;
use crate::budget::{FanOutBudget, FanOutLevel};
use crate::events::WorkflowEventPayload;
use crate::execution::{ExecutionContext, ModelArtifact};
use crate::fanout::fan_out;
use crate::job::JobSpec;
use crate::ledger::{Branch, ItemMarker, ResultRecord};
use crate::resolver::Phase;
use crate::telemetry;

use super::orchestrator::{BranchReport, Services};

/// Run the classical branch: resolve parameter sets, then submit and wait
/// for each with at most `cc_width` in flight.
pub(crate) async fn run(
    services: &Services,
    context: &ExecutionContext,
    artifact: &ModelArtifact,
) -> BranchReport {
    let execution_id = &context.execution_id;
    services.publish(
        execution_id,
        WorkflowEventPayload::BranchDispatched { branch: Branch::Cc },
    );

    let phase = Phase::ParamsForCc;
    let jobs = match services
        .resolver
        .resolve(&phase, context, Some(artifact))
        .and_then(|resolved| resolved.into_jobs(&phase))
    {
        Ok(jobs) => jobs,
        Err(err) => {
            error!(execution_id = %execution_id, error = %err, "CC parameter resolution failed");
            services.publish(
                execution_id,
                WorkflowEventPayload::BranchFinished {
                    branch: Branch::Cc,
                    items: 0,
                },
            );
            return BranchReport::failed(format!("cc: {err}"));
        }
    };

    let items = jobs.len();
    info!(execution_id = %execution_id, items, "dispatching CC items");
    let budget = FanOutBudget::new(
        FanOutLevel::Cc,
        execution_id.clone(),
        services.config.fan_out.cc_width,
    );
    let specs = jobs.clone();
    let task_services = services.clone();
    let outcomes = fan_out(budget, jobs, move |spec: JobSpec| {
        let services = task_services.clone();
        async move { run_item(&services, spec).await }
    })
    .await;
    let failures = services.settle_items(Branch::Cc, &specs, outcomes).await;

    services.publish(
        execution_id,
        WorkflowEventPayload::BranchFinished {
            branch: Branch::Cc,
            items,
        },
    );
    BranchReport { items, failures }
}

async fn run_item(services: &Services, spec: JobSpec) -> Result<(), String> {
    let span = telemetry::job_span(spec.job_id.to_string(), spec.kind.as_str());
    async {
        let timing = telemetry::record_job_start(spec.job_id.to_string());
        let marker = match submit_and_wait(services.backend.as_ref(), &spec).await {
            Ok((_, status)) => ItemMarker::from(status),
            Err(err) => ItemMarker::from(err),
        };
        let status = if marker.is_success() { "succeeded" } else { "failed" };
        telemetry::record_job_end(timing, &spec.execution_id, spec.kind.as_str(), status);
        services
            .record_item(ResultRecord::for_spec(&spec, Branch::Cc, marker))
            .await
    }
    .instrument(span)
    .await
}
