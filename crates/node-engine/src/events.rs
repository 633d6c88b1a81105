//! Event types for streaming execution progress
//!
//! The scheduler reports batch dispatch and node transitions through an
//! [`EventSink`], so a UI or log shipper can follow a run without polling.

use serde::{Deserialize, Serialize};

use crate::types::ExecutionStatus;

/// Trait for sending execution events
///
/// This abstracts over the transport mechanism (channel, websocket, log, etc.)
/// allowing the engine to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        workflow_id: String,
        execution_id: String,
    },

    /// A set of ready nodes was dispatched together
    #[serde(rename_all = "camelCase")]
    BatchStarted {
        execution_id: String,
        node_ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    NodeStarted {
        execution_id: String,
        node_id: String,
    },

    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        execution_id: String,
        node_id: String,
        cache_hit: bool,
    },

    #[serde(rename_all = "camelCase")]
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
    },

    /// Node will not run because an upstream failed, was skipped, or a
    /// branch went the other way
    #[serde(rename_all = "camelCase")]
    NodeSkipped {
        execution_id: String,
        node_id: String,
        reason: String,
    },

    #[serde(rename_all = "camelCase")]
    ExecutionCompleted {
        workflow_id: String,
        execution_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        workflow_id: String,
        execution_id: String,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    ExecutionCancelled {
        workflow_id: String,
        execution_id: String,
    },
}

impl WorkflowEvent {
    /// The terminal event matching `status`, if it is terminal
    pub fn finished(
        workflow_id: &str,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Option<Self> {
        let workflow_id = workflow_id.to_string();
        let execution_id = execution_id.to_string();
        match status {
            ExecutionStatus::Completed => Some(Self::ExecutionCompleted {
                workflow_id,
                execution_id,
            }),
            ExecutionStatus::Failed => Some(Self::ExecutionFailed {
                workflow_id,
                execution_id,
                error: error.unwrap_or_else(|| "One or more nodes failed".to_string()),
            }),
            ExecutionStatus::Cancelled => Some(Self::ExecutionCancelled {
                workflow_id,
                execution_id,
            }),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }

    /// Execution id this event belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::BatchStarted { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeSkipped { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id, .. } => execution_id,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
