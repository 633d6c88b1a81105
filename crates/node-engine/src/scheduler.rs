//! DAG scheduler
//!
//! [`DagEngine`] owns every [`DagExecution`] it creates and is the only code
//! that mutates one. A run proceeds in batches: all ready nodes (pending,
//! every upstream completed) are dispatched together, up to
//! `max_concurrency`, and the next batch is computed only once the current
//! one has fully settled.
//!
//! A failed node marks its whole downstream `skipped`. A completed node whose
//! result carries a `path` label skips the targets of edges whose
//! `sourceHandle` names the other label.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, FailurePolicy};
use crate::constants::input_keys;
use crate::error::{NodeEngineError, Result};
use crate::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::monitor::PerformanceMonitor;
use crate::processor::{
    Environment, NodeInputs, ProcessingContext, ProcessingResult, ProcessorPipeline,
    ResultMetadata,
};
use crate::registry::ProcessorRegistry;
use crate::state::ExecutionStateManager;
use crate::types::{
    DagExecution, ExecutionStatus, NodeId, NodeKind, NodeStatus, WorkflowGraph,
};
use crate::validation::{topological_order, validate_workflow};

/// Summary returned once an execution reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_ms: i64,
    pub node_results: HashMap<NodeId, Value>,
    pub errors: HashMap<NodeId, String>,
    /// Result of the last completed output node
    pub final_output: Option<Value>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl ExecutionReport {
    fn from_execution(exec: &DagExecution) -> Self {
        let end_time = exec.end_time.unwrap_or_else(Utc::now);
        let start_time = exec.start_time.unwrap_or(end_time);

        let mut report = Self {
            execution_id: exec.id.clone(),
            workflow_id: exec.workflow_id.clone(),
            status: exec.status,
            start_time,
            end_time,
            total_duration_ms: (end_time - start_time).num_milliseconds(),
            node_results: HashMap::new(),
            errors: HashMap::new(),
            final_output: None,
            total_nodes: exec.nodes.len(),
            completed_nodes: exec.count(NodeStatus::Completed),
            failed_nodes: exec.count(NodeStatus::Failed),
            skipped_nodes: exec.count(NodeStatus::Skipped),
            total_tokens: 0,
            total_cost: 0.0,
        };

        for node_id in &exec.execution_order {
            let Some(node) = exec.nodes.get(node_id) else {
                continue;
            };
            if let Some(result) = &node.result {
                report.node_results.insert(node_id.clone(), result.clone());
                if node.status == NodeStatus::Completed
                    && NodeKind::parse(&node.node_type) == Some(NodeKind::Output)
                {
                    report.final_output = Some(result.clone());
                }
            }
            if let Some(error) = &node.error {
                report.errors.insert(node_id.clone(), error.clone());
            }
            if let Some(meta) = &node.metadata {
                report.total_tokens += meta.tokens_used.unwrap_or(0);
                report.total_cost += meta.cost.unwrap_or(0.0);
            }
        }

        report
    }
}

struct ExecutionHandle {
    graph: WorkflowGraph,
    execution: Mutex<DagExecution>,
    cancel: CancellationToken,
}

/// How the batch loop ended
enum DriveOutcome {
    /// No node is ready any more
    Drained,
    /// Fail-fast stopped dispatching after a failed batch
    Halted,
    Cancelled,
}

/// One node ready to be dispatched
struct Dispatch {
    node_id: NodeId,
    pipeline: Arc<ProcessorPipeline>,
    ctx: ProcessingContext,
}

pub struct DagEngine {
    registry: Arc<ProcessorRegistry>,
    config: EngineConfig,
    environment: Arc<Environment>,
    event_sink: Arc<dyn EventSink>,
    state_manager: Option<Arc<ExecutionStateManager>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

impl DagEngine {
    pub fn new(registry: Arc<ProcessorRegistry>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config,
            environment: Arc::new(Environment::default()),
            event_sink: Arc::new(NullEventSink),
            state_manager: None,
            monitor: None,
            executions: RwLock::new(HashMap::new()),
        })
    }

    /// Credentials and settings handed to every node
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Push a snapshot into `manager` after every transition
    pub fn with_state_manager(mut self, manager: Arc<ExecutionStateManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    /// Record node timings and usage into `monitor`
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `graph` and register a pending execution for it
    pub fn create_execution(&self, graph: &WorkflowGraph) -> Result<String> {
        let errors = validate_workflow(graph, Some(self.registry.as_ref()));
        if !errors.is_empty() {
            return Err(NodeEngineError::Validation(errors));
        }
        let order =
            topological_order(graph).map_err(|e| NodeEngineError::Validation(vec![e]))?;

        let id = format!("exec-{}", Uuid::new_v4());
        let execution = DagExecution::new(&id, graph, order);
        if let Some(manager) = &self.state_manager {
            manager.create_state(&execution);
        }

        self.executions.write().insert(
            id.clone(),
            Arc::new(ExecutionHandle {
                graph: graph.clone(),
                execution: Mutex::new(execution),
                cancel: CancellationToken::new(),
            }),
        );
        log::info!(
            "Created execution '{}' for workflow '{}' ({} nodes)",
            id,
            graph.id,
            graph.nodes.len()
        );
        Ok(id)
    }

    /// Create and run an execution to completion
    pub async fn run(&self, graph: &WorkflowGraph) -> Result<ExecutionReport> {
        let id = self.create_execution(graph)?;
        self.execute(&id).await
    }

    /// Run a pending execution to a terminal status
    ///
    /// Node failures do not make this return `Err`; they are reported in the
    /// [`ExecutionReport`].
    pub async fn execute(&self, execution_id: &str) -> Result<ExecutionReport> {
        let handle = self.handle(execution_id)?;

        let (workflow_id, node_ids) = {
            let mut exec = handle.execution.lock();
            if exec.status != ExecutionStatus::Pending {
                return Err(NodeEngineError::failed(format!(
                    "Execution '{}' already started",
                    execution_id
                )));
            }
            exec.status = ExecutionStatus::Running;
            exec.start_time = Some(Utc::now());
            (exec.workflow_id.clone(), exec.execution_order.clone())
        };
        if let Some(monitor) = &self.monitor {
            monitor.start_monitoring(execution_id, &workflow_id, &node_ids);
        }
        self.emit(WorkflowEvent::ExecutionStarted {
            workflow_id: workflow_id.clone(),
            execution_id: execution_id.to_string(),
        });
        self.publish(&handle);

        let budget = self.config.execution_timeout;
        let (status, error) = match tokio::time::timeout(budget, self.drive(&handle)).await {
            Ok(DriveOutcome::Cancelled) => (ExecutionStatus::Cancelled, None),
            Ok(DriveOutcome::Halted) => (
                ExecutionStatus::Failed,
                Some("Stopped after first node failure".to_string()),
            ),
            Ok(DriveOutcome::Drained) => {
                if handle.execution.lock().failed_nodes.is_empty() {
                    (ExecutionStatus::Completed, None)
                } else {
                    (ExecutionStatus::Failed, None)
                }
            }
            Err(_) => {
                log::error!(
                    "Execution '{}' timed out after {}ms",
                    execution_id,
                    budget.as_millis()
                );
                (
                    ExecutionStatus::Failed,
                    Some(format!(
                        "Workflow execution timed out after {}ms",
                        budget.as_millis()
                    )),
                )
            }
        };

        let report = self.finish(&handle, status, error.clone());
        if let Some(monitor) = &self.monitor {
            monitor.stop_monitoring(execution_id);
        }
        self.publish(&handle);
        if let Some(event) = WorkflowEvent::finished(&workflow_id, execution_id, status, error) {
            self.emit(event);
        }
        log::info!(
            "Execution '{}' finished {:?}: {} completed, {} failed, {} skipped",
            execution_id,
            report.status,
            report.completed_nodes,
            report.failed_nodes,
            report.skipped_nodes
        );
        Ok(report)
    }

    /// Request cancellation; the run stops at the next opportunity
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let handle = self.handle(execution_id)?;
        log::info!("Cancelling execution '{}'", execution_id);
        handle.cancel.cancel();
        Ok(())
    }

    /// Copy of the live execution
    pub fn get_execution(&self, execution_id: &str) -> Option<DagExecution> {
        self.executions
            .read()
            .get(execution_id)
            .map(|h| h.execution.lock().clone())
    }

    /// Ids of every execution the engine still holds
    pub fn execution_ids(&self) -> Vec<String> {
        self.executions.read().keys().cloned().collect()
    }

    /// Forget an execution; cancels it first if it is still running
    pub fn cleanup(&self, execution_id: &str) -> bool {
        match self.executions.write().remove(execution_id) {
            Some(handle) => {
                handle.cancel.cancel();
                if let Some(monitor) = &self.monitor {
                    monitor.cleanup(execution_id);
                }
                log::debug!("Removed execution '{}'", execution_id);
                true
            }
            None => false,
        }
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| NodeEngineError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn drive(&self, handle: &ExecutionHandle) -> DriveOutcome {
        loop {
            if handle.cancel.is_cancelled() {
                return DriveOutcome::Cancelled;
            }

            let (batch, dispatch_failed) = self.start_batch(handle);
            if batch.is_empty() {
                if !dispatch_failed {
                    return DriveOutcome::Drained;
                }
                // Only dispatch failures this round; other nodes may still be ready
                if self.config.failure_policy == FailurePolicy::FailFast {
                    return DriveOutcome::Halted;
                }
                self.publish(handle);
                continue;
            }

            let results = join_all(batch.iter().map(|dispatch| async move {
                let result = dispatch.pipeline.process(&dispatch.ctx).await;
                (dispatch.node_id.clone(), result)
            }))
            .await;

            let any_failed = self.settle_batch(handle, results) || dispatch_failed;
            self.publish(handle);

            if any_failed && self.config.failure_policy == FailurePolicy::FailFast {
                return DriveOutcome::Halted;
            }
        }
    }

    /// Pick the next ready nodes, mark them running and build their contexts
    ///
    /// Also returns whether any picked node failed before dispatch.
    fn start_batch(&self, handle: &ExecutionHandle) -> (Vec<Dispatch>, bool) {
        let mut events = Vec::new();
        let mut batch = Vec::new();
        let mut undispatchable = Vec::new();
        let exec_id = {
            let mut exec = handle.execution.lock();
            let exec_id = exec.id.clone();
            let ready: Vec<NodeId> = exec
                .execution_order
                .iter()
                .filter(|id| {
                    exec.nodes.get(*id).is_some_and(|n| {
                        n.status == NodeStatus::Pending
                            && n.dependencies.iter().all(|d| exec.completed_nodes.contains(d))
                    })
                })
                .take(self.config.max_concurrency)
                .cloned()
                .collect();

            for node_id in &ready {
                let Some(graph_node) = handle.graph.find_node(node_id) else {
                    continue;
                };

                let mut inputs = NodeInputs::new();
                let deps = exec.nodes[node_id].dependencies.clone();
                for dep in deps {
                    if let Some(result) = exec.nodes.get(&dep).and_then(|n| n.result.clone()) {
                        inputs.insert(dep, result);
                    }
                }
                inputs.insert(input_keys::NODE_DATA, graph_node.data.clone());

                let timeout = graph_node.timeout_override().unwrap_or_else(|| {
                    NodeKind::parse(&graph_node.node_type)
                        .map(|kind| self.config.timeouts.for_kind(kind))
                        .unwrap_or(self.config.timeouts.default)
                });

                let Some(state) = exec.nodes.get_mut(node_id) else {
                    continue;
                };
                state.status = NodeStatus::Running;
                let started = Utc::now();
                state.start_time = Some(started);

                match self.registry.get(&graph_node.node_type) {
                    Ok(pipeline) => {
                        let mut ctx = ProcessingContext::new(node_id, &exec_id, inputs)
                            .with_environment(Arc::clone(&self.environment))
                            .with_timeout(timeout)
                            .with_cancel(handle.cancel.child_token());
                        ctx.metadata.start_time = started;
                        batch.push(Dispatch {
                            node_id: node_id.clone(),
                            pipeline,
                            ctx,
                        });
                    }
                    Err(e) => {
                        // No processor for this type; fail just this node
                        state.status = NodeStatus::Failed;
                        state.end_time = Some(Utc::now());
                        state.error = Some(e.to_string());
                        exec.failed_nodes.insert(node_id.clone());
                        undispatchable.push(node_id.clone());
                        events.push(WorkflowEvent::NodeFailed {
                            execution_id: exec_id.clone(),
                            node_id: node_id.clone(),
                            error: e.to_string(),
                        });
                        events.extend(skip_downstream(&mut exec, node_id, "upstream failed"));
                    }
                }
            }

            exec.current_batch = batch.iter().map(|d| d.node_id.clone()).collect();
            if !batch.is_empty() {
                log::debug!(
                    "Execution '{}' dispatching batch {:?}",
                    exec.id,
                    exec.current_batch
                );
                events.push(WorkflowEvent::BatchStarted {
                    execution_id: exec.id.clone(),
                    node_ids: exec.current_batch.clone(),
                });
                for node_id in &exec.current_batch {
                    events.push(WorkflowEvent::NodeStarted {
                        execution_id: exec.id.clone(),
                        node_id: node_id.clone(),
                    });
                }
            }
            exec_id
        };

        for event in events {
            self.emit(event);
        }
        if let Some(monitor) = &self.monitor {
            for dispatch in &batch {
                monitor.record_node_start(&exec_id, &dispatch.node_id);
            }
            for node_id in &undispatchable {
                monitor.record_node_start(&exec_id, node_id);
                monitor.record_node_completion(&exec_id, node_id, false, None);
            }
        }
        if !batch.is_empty() {
            self.publish(handle);
        }
        (batch, !undispatchable.is_empty())
    }

    /// Record batch results; returns whether any node failed
    fn settle_batch(&self, handle: &ExecutionHandle, results: Vec<(NodeId, ProcessingResult)>) -> bool {
        let mut events = Vec::new();
        let mut outcomes: Vec<(NodeId, bool, ResultMetadata)> = Vec::new();
        let mut any_failed = false;
        let exec_id = {
            let mut exec = handle.execution.lock();
            exec.current_batch.clear();

            for (node_id, result) in results {
                let Some(state) = exec.nodes.get_mut(&node_id) else {
                    continue;
                };
                state.end_time = Some(Utc::now());
                state.metadata = Some(result.metadata.clone());
                outcomes.push((node_id.clone(), result.success, result.metadata.clone()));

                if result.success {
                    let data = result.data.unwrap_or(Value::Null);
                    let path = data.get("path").and_then(|p| p.as_str()).map(str::to_string);
                    state.status = NodeStatus::Completed;
                    state.result = Some(data);
                    exec.completed_nodes.insert(node_id.clone());
                    log::debug!("Node '{}' completed", node_id);
                    events.push(WorkflowEvent::NodeCompleted {
                        execution_id: exec.id.clone(),
                        node_id: node_id.clone(),
                        cache_hit: result.metadata.cache_hit,
                    });

                    if let Some(path) = path {
                        for edge in handle.graph.outgoing_edges(&node_id) {
                            let not_taken = edge
                                .source_handle
                                .as_deref()
                                .is_some_and(|label| label != path);
                            if not_taken {
                                let reason = format!("branch '{}' not taken", path);
                                events.extend(skip_node(&mut exec, &edge.target, &reason));
                            }
                        }
                    }
                } else {
                    any_failed = true;
                    let error = result
                        .error
                        .unwrap_or_else(|| "Node execution failed".to_string());
                    log::warn!("Node '{}' failed: {}", node_id, error);
                    state.status = NodeStatus::Failed;
                    state.error = Some(error.clone());
                    exec.failed_nodes.insert(node_id.clone());
                    events.push(WorkflowEvent::NodeFailed {
                        execution_id: exec.id.clone(),
                        node_id: node_id.clone(),
                        error,
                    });
                    let reason = format!("upstream '{}' failed", node_id);
                    events.extend(skip_downstream(&mut exec, &node_id, &reason));
                }
            }
            exec.id.clone()
        };

        for event in events {
            self.emit(event);
        }
        if let Some(monitor) = &self.monitor {
            for (node_id, success, metadata) in &outcomes {
                monitor.record_node_completion(&exec_id, node_id, *success, Some(metadata));
            }
        }
        any_failed
    }

    /// Close out an execution: interrupted nodes fail, leftovers are skipped
    fn finish(
        &self,
        handle: &ExecutionHandle,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> ExecutionReport {
        let mut events = Vec::new();
        let (report, interrupted_nodes) = {
            let mut exec = handle.execution.lock();
            let now = Utc::now();
            let interrupted = error.unwrap_or_else(|| "Execution cancelled".to_string());
            let exec_id = exec.id.clone();
            let mut newly_failed = Vec::new();

            for node_id in exec.execution_order.clone() {
                let Some(node) = exec.nodes.get_mut(&node_id) else {
                    continue;
                };
                match node.status {
                    NodeStatus::Running => {
                        node.status = NodeStatus::Failed;
                        node.error = Some(interrupted.clone());
                        node.end_time = Some(now);
                        newly_failed.push(node_id.clone());
                        events.push(WorkflowEvent::NodeFailed {
                            execution_id: exec_id.clone(),
                            node_id,
                            error: interrupted.clone(),
                        });
                    }
                    NodeStatus::Pending => {
                        node.status = NodeStatus::Skipped;
                        node.end_time = Some(now);
                        events.push(WorkflowEvent::NodeSkipped {
                            execution_id: exec_id.clone(),
                            node_id,
                            reason: "execution ended".to_string(),
                        });
                    }
                    _ => {}
                }
            }

            exec.failed_nodes.extend(newly_failed.iter().cloned());
            exec.current_batch.clear();
            exec.status = status;
            exec.end_time = Some(now);
            (ExecutionReport::from_execution(&exec), newly_failed)
        };

        for event in events {
            self.emit(event);
        }
        if let Some(monitor) = &self.monitor {
            for node_id in &interrupted_nodes {
                monitor.record_node_completion(&report.execution_id, node_id, false, None);
            }
        }
        report
    }

    fn publish(&self, handle: &ExecutionHandle) {
        if let Some(manager) = &self.state_manager {
            let snapshot = handle.execution.lock().clone();
            manager.update_state(&snapshot);
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Failed to send workflow event: {}", e);
        }
    }
}

/// Skip `node_id` if it is still pending, then everything downstream of it
fn skip_node(exec: &mut DagExecution, node_id: &str, reason: &str) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    let skipped = match exec.nodes.get_mut(node_id) {
        Some(node) if node.status == NodeStatus::Pending => {
            node.status = NodeStatus::Skipped;
            node.end_time = Some(Utc::now());
            true
        }
        _ => false,
    };
    if skipped {
        log::debug!("Skipping node '{}': {}", node_id, reason);
        events.push(WorkflowEvent::NodeSkipped {
            execution_id: exec.id.clone(),
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        });
        events.extend(skip_downstream(exec, node_id, reason));
    }
    events
}

/// Skip every pending node downstream of `node_id`
fn skip_downstream(exec: &mut DagExecution, node_id: &str, reason: &str) -> Vec<WorkflowEvent> {
    let dependents = exec
        .nodes
        .get(node_id)
        .map(|n| n.dependents.clone())
        .unwrap_or_default();

    dependents
        .iter()
        .flat_map(|dependent| skip_node(exec, dependent, reason))
        .collect()
}
