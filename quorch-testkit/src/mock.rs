use async_trait::async_trait;
use parking_lot::Mutex;
use quorch::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the scripted backend does with a matching job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    /// The job runs and ends failed.
    Fail(String),
    /// `submit` itself is rejected.
    RejectSubmit(String),
    /// Terminal status cannot be queried.
    ExecutionError(String),
    /// The job never reaches a terminal state.
    Hang,
}

type Matcher = Box<dyn Fn(&JobSpec) -> bool + Send + Sync>;

#[derive(Default)]
struct BackendState {
    submissions: Vec<JobSpec>,
    model_outcomes: Vec<Outcome>,
    model_attempts: usize,
    outcomes: HashMap<JobId, Outcome>,
    in_flight: HashMap<JobKind, usize>,
    peak: HashMap<JobKind, usize>,
}

/// [`JobBackend`] whose behavior is scripted per job.
///
/// Classical and model jobs finish in `await_terminal`. Quantum jobs finish
/// out of band: when an event bus is attached, submitting one spawns a task
/// that publishes its [`TaskStateChange`]s after `latency`.
#[derive(Clone)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
    rules: Arc<Mutex<Vec<(Matcher, Outcome)>>>,
    bus: Arc<Mutex<Option<Arc<InProcEventBus>>>>,
    latency: Duration,
    next_backend_id: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            rules: Arc::new(Mutex::new(Vec::new())),
            bus: Arc::new(Mutex::new(None)),
            latency: Duration::ZERO,
            next_backend_id: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Delay before a job reaches its terminal state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcomes of successive model-creation attempts; later attempts
    /// succeed.
    pub fn with_model_outcomes(self, outcomes: Vec<Outcome>) -> Self {
        self.state.lock().model_outcomes = outcomes;
        self
    }

    /// Apply `outcome` to every job matching `matcher`. The first matching
    /// rule wins; unmatched jobs succeed.
    pub fn with_rule(
        self,
        matcher: impl Fn(&JobSpec) -> bool + Send + Sync + 'static,
        outcome: Outcome,
    ) -> Self {
        self.rules.lock().push((Box::new(matcher), outcome));
        self
    }

    /// Publish quantum task events on `bus`.
    pub fn attach(&self, bus: Arc<InProcEventBus>) {
        *self.bus.lock() = Some(bus);
    }

    pub fn submissions(&self) -> Vec<JobSpec> {
        self.state.lock().submissions.clone()
    }

    pub fn submissions_of(&self, kind: JobKind) -> Vec<JobSpec> {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|spec| spec.kind == kind)
            .cloned()
            .collect()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Most jobs of `kind` that were non-terminal at the same time.
    pub fn peak_in_flight(&self, kind: JobKind) -> usize {
        self.state.lock().peak.get(&kind).copied().unwrap_or_default()
    }

    fn outcome_for(&self, spec: &JobSpec) -> Outcome {
        if spec.kind == JobKind::CreateModel {
            let mut state = self.state.lock();
            let attempt = state.model_attempts;
            state.model_attempts += 1;
            return state
                .model_outcomes
                .get(attempt)
                .cloned()
                .unwrap_or(Outcome::Succeed);
        }
        self.rules
            .lock()
            .iter()
            .find(|(matcher, _)| matcher(spec))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or(Outcome::Succeed)
    }

    fn started(&self, kind: JobKind) {
        let mut state = self.state.lock();
        let current = {
            let entry = state.in_flight.entry(kind).or_default();
            *entry += 1;
            *entry
        };
        let peak = state.peak.entry(kind).or_default();
        *peak = (*peak).max(current);
    }

    fn finished(state: &Mutex<BackendState>, kind: JobKind) {
        if let Some(entry) = state.lock().in_flight.get_mut(&kind) {
            *entry = entry.saturating_sub(1);
        }
    }

    fn emit_quantum_events(&self, spec: &JobSpec, outcome: Outcome) {
        let Some(bus) = self.bus.lock().clone() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        let task_id = spec.task_id.clone();
        let device = spec.device.clone();
        tokio::spawn(async move {
            let with_device = |change: TaskStateChange| match &device {
                Some(device) => change.with_device(device.clone()),
                None => change,
            };
            let running = TaskStateChange::new(task_id.clone(), TaskState::Running);
            bus.publish_task(with_device(running));
            tokio::time::sleep(latency).await;
            let terminal = match outcome {
                Outcome::Succeed => TaskStateChange::new(task_id, TaskState::Completed),
                Outcome::Fail(reason) | Outcome::ExecutionError(reason) => {
                    TaskStateChange::new(task_id, TaskState::Failed).with_reason(reason)
                }
                Outcome::Hang | Outcome::RejectSubmit(_) => return,
            };
            ScriptedBackend::finished(&state, JobKind::Quantum);
            bus.publish_task(with_device(terminal));
        });
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError> {
        let outcome = self.outcome_for(spec);
        self.state.lock().submissions.push(spec.clone());
        if let Outcome::RejectSubmit(reason) = &outcome {
            return Err(BackendError::Submission(reason.clone()));
        }
        self.started(spec.kind);
        let backend_id = format!(
            "scripted-{}",
            self.next_backend_id.fetch_add(1, Ordering::SeqCst)
        );
        if spec.kind == JobKind::Quantum {
            self.emit_quantum_events(spec, outcome);
        } else {
            self.state.lock().outcomes.insert(spec.job_id, outcome);
        }
        Ok(JobHandle::submitted(spec, backend_id))
    }

    async fn await_terminal(&self, handle: &JobHandle) -> Result<TerminalStatus, BackendError> {
        let (outcome, kind) = {
            let state = self.state.lock();
            let outcome = state
                .outcomes
                .get(&handle.job_id)
                .cloned()
                .unwrap_or(Outcome::Succeed);
            let kind = state
                .submissions
                .iter()
                .rev()
                .find(|spec| spec.job_id == handle.job_id)
                .map(|spec| spec.kind)
                .unwrap_or(JobKind::Classical);
            (outcome, kind)
        };
        if outcome == Outcome::Hang {
            return std::future::pending().await;
        }
        tokio::time::sleep(self.latency).await;
        Self::finished(&self.state, kind);
        match outcome {
            Outcome::Fail(reason) => Ok(TerminalStatus::Failed { reason }),
            Outcome::ExecutionError(reason) => Err(BackendError::Execution(reason)),
            _ => Ok(TerminalStatus::Succeeded),
        }
    }
}

#[derive(Clone, Debug)]
enum DeviceAnswer {
    Status(DeviceAvailability),
    Error(String),
    Stall,
}

/// [`DeviceOracle`] with fixed answers per device. Unlisted devices are
/// ONLINE.
#[derive(Clone, Default)]
pub struct StaticDeviceOracle {
    answers: Arc<Mutex<HashMap<DeviceArn, DeviceAnswer>>>,
    queries: Arc<Mutex<Vec<DeviceArn>>>,
}

impl StaticDeviceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, device: impl Into<DeviceArn>, status: DeviceAvailability) -> Self {
        self.answers
            .lock()
            .insert(device.into(), DeviceAnswer::Status(status));
        self
    }

    pub fn with_error(self, device: impl Into<DeviceArn>, reason: impl Into<String>) -> Self {
        self.answers
            .lock()
            .insert(device.into(), DeviceAnswer::Error(reason.into()));
        self
    }

    /// The oracle never answers for `device`.
    pub fn with_stall(self, device: impl Into<DeviceArn>) -> Self {
        self.answers.lock().insert(device.into(), DeviceAnswer::Stall);
        self
    }

    pub fn queries(&self) -> Vec<DeviceArn> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl DeviceOracle for StaticDeviceOracle {
    async fn status(&self, device: &DeviceArn) -> Result<DeviceAvailability, BackendError> {
        self.queries.lock().push(device.clone());
        let answer = self.answers.lock().get(device).cloned();
        match answer {
            None => Ok(DeviceAvailability::Online),
            Some(DeviceAnswer::Status(status)) => Ok(status),
            Some(DeviceAnswer::Error(reason)) => Err(BackendError::Execution(reason)),
            Some(DeviceAnswer::Stall) => std::future::pending().await,
        }
    }
}

/// [`Notifier`] that keeps every notification.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Wait until at least `n` notifications arrived or `timeout` passed.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < n && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.notifications()
    }

    pub fn assert_notification_count_eq(&self, expected: usize) {
        let actual = self.count();
        assert_eq!(
            actual, expected,
            "Expected {expected} notifications, got {actual}"
        );
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

/// [`Aggregator`] wrapper counting calls per execution.
#[derive(Clone)]
pub struct CountingAggregator {
    inner: Arc<dyn Aggregator>,
    calls: Arc<Mutex<HashMap<ExecutionId, usize>>>,
}

impl CountingAggregator {
    pub fn new(inner: Arc<dyn Aggregator>) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn calls(&self, execution_id: &ExecutionId) -> usize {
        self.calls.lock().get(execution_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Aggregator for CountingAggregator {
    async fn aggregate(&self, execution_id: &ExecutionId) -> anyhow::Result<AggregateSummary> {
        *self.calls.lock().entry(execution_id.clone()).or_default() += 1;
        self.inner.aggregate(execution_id).await
    }
}
