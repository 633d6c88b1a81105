//! Node Engine - DAG workflow execution
//!
//! This crate runs a workflow graph (AI model calls, data transforms,
//! branches, aggregations, validations) to completion. It supports:
//!
//! - Batch-parallel scheduling with a concurrency limit
//! - Skip propagation below failed nodes and untaken branches
//! - Pluggable node processors selected by node type
//! - A middleware chain around every processor (caching, retry with backoff)
//! - Per-attempt and per-execution timeouts, and cancellation
//! - An observable execution state ledger with derived statistics
//! - Per-node performance metrics with bottleneck detection
//!
//! # Architecture
//!
//! - `DagEngine`: owns executions, dispatches ready nodes in batches
//! - `ProcessorPipeline`: template around a `NodeProcessor` that never fails
//! - `Middleware`: chain-of-responsibility wrappers (`CachingMiddleware`, `RetryMiddleware`)
//! - `ExecutionStateManager`: subscribable snapshots, decoupled from the scheduler
//! - `PerformanceMonitor`: node timings, usage and cache hits per execution
//! - `EventSink`: generic event streaming
//!
//! # Example
//!
//! ```ignore
//! use node_engine::{DagEngine, EngineConfig, ProcessorRegistry, WorkflowGraph};
//!
//! let registry = Arc::new(workflow_nodes::build_registry(&config, providers));
//! let engine = DagEngine::new(registry, EngineConfig::default())?;
//! let report = engine.run(&WorkflowGraph::from_json(json)?).await?;
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod middleware;
pub mod monitor;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod state;
mod subscribers;
pub mod types;
pub mod validation;

// Re-export key types
pub use config::{CacheConfig, EngineConfig, FailurePolicy, NodeTimeouts, RetryConfig};
pub use error::{NodeEngineError, Result};
pub use events::{EventError, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use middleware::{CachingMiddleware, Middleware, Next, RetryMiddleware};
pub use monitor::{
    AggregatedPerformance, ExecutionPerformance, LiveProgress, NodePerformance, NodeRunOutcome,
    PerformanceMonitor,
};
pub use processor::{
    ContextMetadata, Environment, NodeInputs, NodeProcessor, ProcessingContext,
    ProcessingResult, ProcessorPipeline, ResultMetadata,
};
pub use registry::ProcessorRegistry;
pub use scheduler::{DagEngine, ExecutionReport};
pub use state::{
    ExecutionMetrics, ExecutionProgress, ExecutionState, ExecutionStateManager,
    ExecutionStatistics, NodeStateMirror,
};
pub use subscribers::Subscription;
pub use types::{
    DagExecution, ExecutionStatus, GraphEdge, GraphNode, NodeId, NodeKind, NodeRunState,
    NodeStatus, WorkflowGraph,
};
pub use validation::{topological_order, validate_workflow, ValidationError};

// Used by processor implementations without a direct dependency
pub use async_trait::async_trait;
