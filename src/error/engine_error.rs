//! Engine-level error types.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level errors.
///
/// Validation errors (`AmbiguousExecution`, `ActivityInstanceNotFound`,
/// `UnsupportedInstantiationTarget`, ...) are reported before any mutation;
/// a command that returns one of them leaves the execution tree and the job
/// store untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Graph build error: {0}")]
    GraphBuild(String),
    #[error("Graph validation error: {0}")]
    GraphValidation(String),
    #[error("Activity not found: {0}")]
    ActivityNotFound(String),
    #[error("Transition not found: {0}")]
    TransitionNotFound(String),
    #[error("Process definition not found: {0}")]
    ProcessNotFound(String),
    #[error("Process instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("Activity instance not found: {0}")]
    ActivityInstanceNotFound(String),
    #[error("Execution is ambiguous for activity {0}")]
    AmbiguousExecution(String),
    #[error("There are {found} (!= 1) executions for activity instance {instance_id}")]
    AmbiguousActivityInstance { instance_id: String, found: usize },
    #[error("Cannot instantiate element: {0}")]
    UnsupportedInstantiationTarget(String),
    #[error("Execution {execution} at activity {activity:?} cannot be signalled")]
    NotSignallable {
        execution: String,
        activity: Option<String>,
    },
    #[error("Max operations exceeded: {0}")]
    MaxOperationsExceeded(usize),
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Optimistic lock failed for job {0}")]
    OptimisticLock(String),
    #[error("Job {id} is not locked by {owner}")]
    NotLockOwner { id: String, owner: String },
    #[error("Internal error: {0}")]
    Internal(String),
}
