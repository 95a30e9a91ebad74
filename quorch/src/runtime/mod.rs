use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Builder for constructing orchestrator instances.
pub mod builder;
/// Classical branch: bounded submit-and-wait fan-out.
mod cc;
/// Top-level state machine and execution lifecycle.
pub mod orchestrator;
/// Quantum branch: per-device fan-out with suspended items.
mod qc;
/// Cooperative cancellation tokens.
pub mod signal;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{ExecutionHandle, ExecutionOutcome, Orchestrator};
pub use signal::{AbortToken, ShutdownToken};

/// Step of the top-level execution state machine.
///
/// `ValidateInput -> CreateModel -> SelectMode -> (RunCc | RunQc | RunBoth)
/// -> Aggregate -> Notify -> Done`, with `Failed` reachable from any step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    ValidateInput,
    CreateModel,
    SelectMode,
    RunCc,
    RunQc,
    RunBoth,
    /// Entered by a resumed execution while it waits for outstanding
    /// continuations.
    Recover,
    Aggregate,
    Notify,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::ValidateInput => "validate_input",
            WorkflowState::CreateModel => "create_model",
            WorkflowState::SelectMode => "select_mode",
            WorkflowState::RunCc => "run_cc",
            WorkflowState::RunQc => "run_qc",
            WorkflowState::RunBoth => "run_both",
            WorkflowState::Recover => "recover",
            WorkflowState::Aggregate => "aggregate",
            WorkflowState::Notify => "notify",
            WorkflowState::Done => "done",
            WorkflowState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }
}

impl Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
