use thiserror::Error;

use crate::execution::ExecutionId;
use crate::job::TaskId;

/// Failure of a single call against the job backend.
///
/// A `Submission` error means the work never started; an `Execution` error
/// means it started and then failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The act of submitting (or querying) the job failed.
    #[error("submission error: {0}")]
    Submission(String),
    /// The job ran and reached a failed terminal state.
    #[error("execution failure: {0}")]
    Execution(String),
}

/// Rejection raised while validating or resolving parameters.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("phase {phase} requires {missing}")]
    MissingContext {
        phase: &'static str,
        missing: &'static str,
    },
    #[error("phase {0} produced an unexpected resolution")]
    UnexpectedResolution(&'static str),
}

/// Errors raised by the continuation channel.
#[derive(Debug, Error)]
pub enum ContinuationError {
    /// No pending continuation is registered for the task.
    #[error("no pending continuation for task {0}")]
    UnknownTask(TaskId),
    /// The continuation was already redeemed once.
    #[error("continuation for task {0} was already redeemed")]
    AlreadyRedeemed(TaskId),
    /// A token or task id collided with an existing registration.
    #[error("continuation for task {0} is already registered")]
    DuplicateRegistration(TaskId),
    /// The backing store failed.
    #[error("continuation store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Top-level failure of an execution.
///
/// Per-item failures never show up here: they are recorded as markers in the
/// result ledger instead.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid input for execution {execution_id}: {reason}")]
    InvalidInput {
        execution_id: ExecutionId,
        reason: String,
    },
    #[error(
        "model creation failed for execution {execution_id} after {attempts} attempt(s): {reason}"
    )]
    ModelCreationFailed {
        execution_id: ExecutionId,
        attempts: u16,
        reason: String,
    },
    #[error("execution {0} timed out")]
    Timeout(ExecutionId),
    #[error("execution {0} was aborted")]
    Aborted(ExecutionId),
    #[error("aggregation failed for execution {execution_id}: {source}")]
    Aggregation {
        execution_id: ExecutionId,
        #[source]
        source: anyhow::Error,
    },
    #[error("notification failed for execution {execution_id}: {source}")]
    Notification {
        execution_id: ExecutionId,
        #[source]
        source: anyhow::Error,
    },
    #[error("internal error in execution {execution_id}: {reason}")]
    Internal {
        execution_id: ExecutionId,
        reason: String,
    },
}

impl WorkflowError {
    /// Execution the error belongs to.
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            WorkflowError::InvalidInput { execution_id, .. }
            | WorkflowError::ModelCreationFailed { execution_id, .. }
            | WorkflowError::Aggregation { execution_id, .. }
            | WorkflowError::Notification { execution_id, .. }
            | WorkflowError::Internal { execution_id, .. } => execution_id,
            WorkflowError::Timeout(execution_id)
            | WorkflowError::Aborted(execution_id) => execution_id,
        }
    }
}
