//! Quorch - fan-out/fan-in orchestration of hybrid classical and quantum
//! experiment jobs.
//!
//! One submitted experiment becomes one execution: its input is validated,
//! a model is built once, then classical (CC) and quantum (QC) jobs fan out
//! over parameter sets and devices under bounded concurrency. Every item
//! ends as a terminal marker; the markers are aggregated once and the
//! submitter is notified once.
//!
//! # Core Concepts
//!
//! - **Execution**: one run, keyed by [`ExecutionId`] and carried through every
//!   phase by a read-only [`ExecutionContext`].
//!
//! - **Resolver**: the [`ParameterResolver`] trait turns `(phase, context)` into
//!   job specs, device lists and the normalized input.
//!
//! - **Backends**: [`JobBackend`] runs container jobs, [`DeviceOracle`] reports
//!   device availability and [`TaskRunner`] starts quantum tasks whose completion
//!   arrives later as a [`TaskStateChange`].
//!
//! - **Continuations**: a QC item registers a [`ContinuationRecord`] before
//!   submission and suspends on the [`ContinuationHub`] until the
//!   [`TaskEventListener`] redeems it.
//!
//! - **Fan-out**: [`fan_out`] maps items with a per-fan-out [`FanOutBudget`] and
//!   captures every outcome as data, so one failed item never aborts its siblings.
//!
//! - **Runtime**: the [`Orchestrator`](runtime::Orchestrator) ties the pieces into
//!   the execution state machine, with a timeout, abort and restart recovery.
//!
//! # Feature Flags
//!
//! - `postgres` - durable continuation store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use quorch::runtime::OrchestratorBuilder;
//! use quorch::*;
//!
//! let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
//!     .with_backend(backend)
//!     .with_oracle(oracle)
//!     .with_notifier(Arc::new(LogNotifier))
//!     .build()?;
//! orchestrator.start().await?;
//!
//! let outcome = orchestrator
//!     .run(SubmissionRequest::new(json!({ "runMode": "QC" })))
//!     .await?;
//! ```

/// Aggregation of result rows and archiving of finished executions.
///
/// [`Aggregator`] and [`LedgerAggregator`] roll up the markers of one
/// execution into an [`AggregateSummary`]; [`ContextArchive`] stores the
/// frozen context alongside it.
pub mod aggregate;

/// Collaborator traits for the job backend, the device oracle and the
/// quantum task runner.
pub mod backend;

/// Per-fan-out concurrency limiting.
///
/// [`FanOutBudget`] hands out [`BudgetToken`]s and tracks in-flight and peak
/// counts for each [`FanOutLevel`].
pub mod budget;

/// Configuration structures for the orchestrator, resolver and persistence.
pub mod config;

/// Durable suspend/redeem for quantum items.
pub mod continuation;

/// Error taxonomy.
pub mod error;

/// Workflow and task-state events, and the in-process bus carrying them.
///
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`WorkflowEvent`] and [`WorkflowEventPayload`] for orchestrator progress
/// - [`TaskStateChange`] for backend task lifecycle
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Execution identity, run mode and per-execution context.
pub mod execution;

/// Bounded-concurrency map combinator.
pub mod fanout;

/// Job identifiers, specs, handles and terminal statuses.
pub mod job;

/// Per-item result markers and the sink they are written to.
pub mod ledger;

/// Redeems continuations from task-state-change events.
pub mod listener;

/// Prometheus metrics (feature `metrics`).
pub mod metrics;

/// Terminal notifications and the failure watch.
pub mod notify;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed continuation store
/// when the `postgres` feature is enabled.
pub mod persistence;

/// Parameter resolution and experiment input validation.
pub mod resolver;

/// Retry and backoff policy.
pub mod retry;

/// The execution state machine.
///
/// - [`Orchestrator`](runtime::Orchestrator) - submits, resumes and supervises executions
/// - [`OrchestratorBuilder`](runtime::OrchestratorBuilder) - explicit dependency wiring
/// - [`ExecutionHandle`](runtime::ExecutionHandle) - wait for or abort one execution
/// - [`ShutdownToken`](runtime::ShutdownToken) - graceful shutdown signaling
pub mod runtime;

/// Tracing spans and structured record helpers.
pub mod telemetry;

pub use aggregate::*;
pub use backend::*;
pub use budget::*;
pub use config::*;
pub use continuation::*;
pub use error::*;
pub use events::*;
pub use execution::*;
pub use fanout::*;
pub use job::*;
pub use ledger::*;
pub use listener::*;
pub use notify::*;
pub use resolver::*;
pub use retry::*;
