//! Error types for the Workflow layer

use crate::{InstanceId, TaskId, TaskState};

/// A subflow or called element that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Subflow '{key}@v{version}' not found in catalog or not published")]
    NotFound { key: String, version: u32 },

    #[error("No subprocess definition supplied for called element '{0}'")]
    UnresolvedCalledElement(String),

    #[error("Malformed called element '{0}': expected '<key>@v<version>'")]
    MalformedCalledElement(String),
}

/// Errors that can occur while running workflow instances
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("Element '{element}' not found in process '{process}'")]
    ElementNotFound { process: String, element: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Handler for task '{node}' ({task}) failed: {message}")]
    Handler {
        task: TaskId,
        node: String,
        message: String,
    },

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Workflow already completed")]
    AlreadyCompleted,

    #[error("Workflow instance {0} was cancelled")]
    InstanceCancelled(InstanceId),

    #[error("Workflow is not waiting for event '{event}'")]
    NotWaiting { event: String },

    #[error("Ambiguous correlation: {matches} waits match event '{event}'")]
    AmbiguousCorrelation { event: String, matches: usize },

    #[error("No waiting task matches '{0}'")]
    TaskNotWaiting(String),

    #[error("Gateway '{0}' has no branch to take")]
    NoBranchTaken(String),

    #[error("Step limit of {0} exceeded while advancing")]
    StepLimitExceeded(usize),

    #[error("State serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
