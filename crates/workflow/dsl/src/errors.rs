//! DSL error types

use procflow_types::{LookupError, WorkflowError};

/// Problems found in a manifest before compilation
///
/// Every variant names the node or field at fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Manifest has no 'start' field")]
    MissingStart,

    #[error("Manifest has no 'nodes' field")]
    MissingNodes,

    #[error("Duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("Start node '{0}' does not exist")]
    UnknownStartNode(String),

    #[error("Node '{node}' has next '{next}' which does not exist")]
    UnknownNextNode { node: String, next: String },

    #[error("Call node '{node}' is missing required field '{field}'")]
    MissingCallField { node: String, field: String },

    #[error("Gateway '{0}' has no branches")]
    EmptyGateway(String),

    #[error("Gateway '{gateway}' must have exactly one default branch, found {count}")]
    DefaultBranchCount { gateway: String, count: usize },

    #[error("Gateway '{gateway}' has a branch to '{target}' which does not exist")]
    UnknownBranchTarget { gateway: String, target: String },

    #[error("Start node '{0}' is referenced but has no 'next'")]
    StartWithoutNext(String),

    #[error("Cycle detected at node '{node}'")]
    CycleDetected { node: String },
}

/// Errors that can occur during validation, compilation or loading
#[derive(Debug, thiserror::Error)]
pub enum DslError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Workflow error: {0}")]
    Workflow(WorkflowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WorkflowError> for DslError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Lookup(lookup) => Self::Lookup(lookup),
            other => Self::Workflow(other),
        }
    }
}

impl From<serde_json::Error> for DslError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result type alias for DSL operations
pub type DslResult<T> = Result<T, DslError>;
