//! Error types for the node engine

use std::time::Duration;

use thiserror::Error;

use crate::validation::ValidationError;

/// Result type alias using NodeEngineError
pub type Result<T> = std::result::Result<T, NodeEngineError>;

/// Errors that can occur in the node engine
#[derive(Debug, Error)]
pub enum NodeEngineError {
    /// Workflow graph failed structural validation
    #[error("Invalid workflow: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// Engine or node configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node execution failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// A single processor attempt exceeded its time budget
    #[error("Node '{node_id}' timed out after {}ms", .after.as_millis())]
    Timeout { node_id: String, after: Duration },

    /// Execution was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No execution registered under this id
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// No processor registered for a node type
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),
}

impl NodeEngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
