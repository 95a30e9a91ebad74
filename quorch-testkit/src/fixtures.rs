use quorch::runtime::{Orchestrator, OrchestratorBuilder};
use quorch::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::mock::{CountingAggregator, RecordingNotifier, ScriptedBackend, StaticDeviceOracle};

pub const DEVICE_A: &str = "arn:aws:braket:::device/qpu/d-wave/DW_2000Q_6";
pub const DEVICE_B: &str = "arn:aws:braket:::device/qpu/d-wave/Advantage_system4";

/// Builder for experiment `userInput` documents.
///
/// Defaults to three parameter sets (`M = 1..=3`), one CC resource and
/// both devices.
#[derive(Clone, Debug)]
pub struct ExperimentInputBuilder {
    run_mode: Option<String>,
    m: Vec<u32>,
    devices: Vec<String>,
    cc_resources: Vec<[u32; 2]>,
}

impl Default for ExperimentInputBuilder {
    fn default() -> Self {
        Self {
            run_mode: None,
            m: vec![1, 2, 3],
            devices: vec![DEVICE_A.to_string(), DEVICE_B.to_string()],
            cc_resources: vec![[2, 2]],
        }
    }
}

impl ExperimentInputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_mode(mut self, run_mode: impl Into<String>) -> Self {
        self.run_mode = Some(run_mode.into());
        self
    }

    pub fn m(mut self, m: Vec<u32>) -> Self {
        self.m = m;
        self
    }

    pub fn devices(mut self, devices: &[&str]) -> Self {
        self.devices = devices.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn cc_resources(mut self, resources: Vec<[u32; 2]>) -> Self {
        self.cc_resources = resources;
        self
    }

    pub fn build(self) -> Value {
        let mut input = json!({
            "version": "1",
            "molFile": "s3://quorch-test/molecule/117_ideal.mol2",
            "modelVersion": "v1",
            "experimentName": "testkit",
            "modelParams": {"M": self.m, "D": [4], "A": [300], "HQ": [200]},
            "devicesArns": self.devices,
            "ccResources": self.cc_resources,
        });
        if let Some(run_mode) = self.run_mode {
            input["runMode"] = json!(run_mode);
        }
        input
    }

    pub fn request(self) -> SubmissionRequest {
        SubmissionRequest::new(self.build())
    }
}

/// Config with short retry delays and a namespaced resolver.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_model_retry(RetryPolicy::default().with_base_delay(Duration::from_millis(10)))
        .with_ledger_retry(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(5)),
        )
        .with_resolver(ResolverConfig::default().with_namespace("quorch-test", "exp"))
}

/// A started orchestrator over scripted collaborators.
///
/// The backend, ledger and continuation store are shared with the
/// orchestrator, so tests can inspect them after a run.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub backend: ScriptedBackend,
    pub oracle: StaticDeviceOracle,
    pub notifier: RecordingNotifier,
    pub aggregator: CountingAggregator,
    pub ledger: Arc<InMemoryResultLedger>,
    pub store: Arc<InMemoryContinuationStore>,
    pub bus: Arc<InProcEventBus>,
}

impl TestHarness {
    pub async fn start(
        config: OrchestratorConfig,
        backend: ScriptedBackend,
        oracle: StaticDeviceOracle,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(InMemoryContinuationStore::new());
        Self::start_with_store(config, backend, oracle, store).await
    }

    /// Start over an existing continuation store, e.g. to simulate a
    /// restarted process.
    pub async fn start_with_store(
        config: OrchestratorConfig,
        backend: ScriptedBackend,
        oracle: StaticDeviceOracle,
        store: Arc<InMemoryContinuationStore>,
    ) -> anyhow::Result<Self> {
        let bus = Arc::new(InProcEventBus::new(config.event_capacity));
        backend.attach(Arc::clone(&bus));
        let ledger = Arc::new(InMemoryResultLedger::new());
        let aggregator = CountingAggregator::new(Arc::new(LedgerAggregator::new(
            Arc::clone(&ledger) as Arc<dyn ResultSink>,
        )));
        let notifier = RecordingNotifier::new();

        let orchestrator = OrchestratorBuilder::new(config)
            .with_backend(Arc::new(backend.clone()))
            .with_oracle(Arc::new(oracle.clone()))
            .with_notifier(Arc::new(notifier.clone()))
            .with_aggregator(Arc::new(aggregator.clone()))
            .with_ledger(Arc::clone(&ledger) as Arc<dyn ResultSink>)
            .with_continuation_store(Arc::clone(&store) as Arc<dyn ContinuationStore>)
            .with_event_bus(Arc::clone(&bus))
            .build()?;
        orchestrator.start().await?;

        Ok(Self {
            orchestrator,
            backend,
            oracle,
            notifier,
            aggregator,
            ledger,
            store,
            bus,
        })
    }

    /// Result rows of one execution.
    pub async fn records(&self, execution_id: &ExecutionId) -> Vec<ResultRecord> {
        self.ledger.records(execution_id).await.unwrap_or_default()
    }
}
