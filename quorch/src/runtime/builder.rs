use std::fmt;
use std::sync::Arc;

use crate::aggregate::{Aggregator, ContextArchive, InMemoryContextArchive, LedgerAggregator};
use crate::backend::{BackendTaskRunner, DeviceOracle, JobBackend, TaskRunner};
use crate::config::OrchestratorConfig;
use crate::continuation::{ContinuationHub, ContinuationStore, InMemoryContinuationStore};
use crate::events::InProcEventBus;
use crate::ledger::{InMemoryResultLedger, ResultSink};
use crate::notify::Notifier;
use crate::resolver::{ExperimentResolver, ParameterResolver};

use super::orchestrator::{Orchestrator, Services};

/// Builder for constructing an [`Orchestrator`] with explicit dependencies.
///
/// The job backend, device oracle and notifier are required. Everything
/// else falls back to an in-memory or default implementation:
///
/// - resolver: [`ExperimentResolver`] over the config's resolver section
/// - task runner: [`BackendTaskRunner`] over the job backend
/// - continuation store: [`InMemoryContinuationStore`]
/// - ledger: [`InMemoryResultLedger`]
/// - aggregator: [`LedgerAggregator`] over the ledger
/// - archive: [`InMemoryContextArchive`]
/// - event bus: [`InProcEventBus`] sized by `event_capacity`
///
/// # Example
///
/// ```ignore
/// use quorch::*;
///
/// let orchestrator = OrchestratorBuilder::new(config)
///     .with_backend(backend)
///     .with_oracle(oracle)
///     .with_notifier(notifier)
///     .build()?;
/// orchestrator.start().await?;
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    resolver: Option<Arc<dyn ParameterResolver>>,
    backend: Option<Arc<dyn JobBackend>>,
    runner: Option<Arc<dyn TaskRunner>>,
    oracle: Option<Arc<dyn DeviceOracle>>,
    store: Option<Arc<dyn ContinuationStore>>,
    ledger: Option<Arc<dyn ResultSink>>,
    aggregator: Option<Arc<dyn Aggregator>>,
    archive: Option<Arc<dyn ContextArchive>>,
    notifier: Option<Arc<dyn Notifier>>,
    bus: Option<Arc<InProcEventBus>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("resolver_set", &self.resolver.is_some())
            .field("backend_set", &self.backend.is_some())
            .field("runner_set", &self.runner.is_some())
            .field("oracle_set", &self.oracle.is_some())
            .field("store_set", &self.store.is_some())
            .field("ledger_set", &self.ledger.is_some())
            .field("aggregator_set", &self.aggregator.is_some())
            .field("archive_set", &self.archive.is_some())
            .field("notifier_set", &self.notifier.is_some())
            .field("bus_set", &self.bus.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            resolver: None,
            backend: None,
            runner: None,
            oracle: None,
            store: None,
            ledger: None,
            aggregator: None,
            archive: None,
            notifier: None,
            bus: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the runner that starts quantum tasks.
    pub fn with_task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn DeviceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_continuation_store(mut self, store: Arc<dyn ContinuationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn ResultSink>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ContextArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Share an existing event bus, e.g. one a backend publishes task
    /// state changes on.
    pub fn with_event_bus(mut self, bus: Arc<InProcEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build the [`Orchestrator`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a required dependency
    /// is missing.
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend dependency missing"))?;
        let oracle = self
            .oracle
            .ok_or_else(|| anyhow::anyhow!("oracle dependency missing"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notifier dependency missing"))?;

        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(ExperimentResolver::new(self.config.resolver.clone()))
        });
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(BackendTaskRunner::new(Arc::clone(&backend))));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryContinuationStore::new()));
        let mut hub = ContinuationHub::new(store);
        if let Some(interval) = self.config.continuation_poll() {
            hub = hub.with_poll_interval(interval);
        }
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryResultLedger::new()));
        let aggregator = self
            .aggregator
            .unwrap_or_else(|| Arc::new(LedgerAggregator::new(Arc::clone(&ledger))));
        let archive = self
            .archive
            .unwrap_or_else(|| Arc::new(InMemoryContextArchive::new()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.event_capacity)));

        Ok(Orchestrator::new(Services {
            config: Arc::new(self.config),
            resolver,
            backend,
            runner,
            oracle,
            hub,
            ledger,
            aggregator,
            archive,
            notifier,
            bus,
        }))
    }
}
