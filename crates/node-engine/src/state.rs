//! Execution state manager
//!
//! An observable ledger of execution progress, decoupled from the scheduler.
//! Snapshots are derived by copying from a [`DagExecution`]; the manager
//! never mutates an execution. Subscribers are called synchronously on every
//! [`update_state`](ExecutionStateManager::update_state), in call order.
//!
//! Snapshots live until [`cleanup`](ExecutionStateManager::cleanup) is
//! called. As a safety net, [`sweep_stale`](ExecutionStateManager::sweep_stale)
//! drops snapshots that have not been refreshed for a while.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::defaults;
use crate::subscribers::{SubscriberTable, Subscription};
use crate::types::{DagExecution, ExecutionStatus, NodeRunState, NodeStatus};

/// Progress counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub currently_running: Vec<String>,
}

/// Timing and usage totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set once the execution has ended
    pub duration_ms: Option<i64>,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Mirror of one node's run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateMirror {
    pub status: NodeStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl From<&NodeRunState> for NodeStateMirror {
    fn from(node: &NodeRunState) -> Self {
        Self {
            status: node.status,
            start_time: node.start_time,
            end_time: node.end_time,
            duration_ms: elapsed_ms(node.start_time, node.end_time),
            result: node.result.clone(),
            error: node.error.clone(),
        }
    }
}

/// Derived snapshot of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub progress: ExecutionProgress,
    pub metrics: ExecutionMetrics,
    pub node_states: HashMap<String, NodeStateMirror>,
    pub last_updated: DateTime<Utc>,
}

impl ExecutionState {
    fn from_execution(execution: &DagExecution) -> Self {
        let mut state = Self {
            id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            progress: ExecutionProgress {
                total_nodes: execution.nodes.len(),
                ..Default::default()
            },
            metrics: ExecutionMetrics::default(),
            node_states: HashMap::new(),
            last_updated: Utc::now(),
        };
        state.refresh(execution);
        state
    }

    fn refresh(&mut self, execution: &DagExecution) {
        self.status = execution.status;
        self.progress.total_nodes = execution.nodes.len();
        self.progress.completed_nodes = execution.completed_nodes.len();
        self.progress.failed_nodes = execution.failed_nodes.len();
        self.progress.currently_running = execution.current_batch.clone();

        self.metrics.start_time = execution.start_time;
        self.metrics.end_time = execution.end_time;
        self.metrics.duration_ms = elapsed_ms(execution.start_time, execution.end_time);

        for (node_id, node) in &execution.nodes {
            self.node_states.insert(node_id.clone(), NodeStateMirror::from(node));
        }

        let (tokens, cost) = self
            .node_states
            .values()
            .filter_map(|n| n.result.as_ref())
            .filter(|r| r.is_object())
            .fold((0u64, 0.0f64), |(tokens, cost), result| {
                (
                    tokens + result.get("tokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                    cost + result.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
                )
            });
        self.metrics.total_tokens = tokens;
        self.metrics.total_cost = cost;
        self.last_updated = Utc::now();
    }
}

/// Aggregates over a set of snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatistics {
    /// Snapshots that reached completed or failed
    pub total_executions: usize,
    /// Percentage of those that completed
    pub success_rate: f64,
    /// Mean duration over completed-or-failed snapshots
    pub average_duration_ms: f64,
    /// Summed over every snapshot, including running ones
    pub total_tokens: u64,
    pub total_cost: f64,
}

struct Tracked {
    state: ExecutionState,
    refreshed_at: Instant,
}

pub struct ExecutionStateManager {
    states: RwLock<HashMap<String, Tracked>>,
    listeners: SubscriberTable<ExecutionState>,
    stale_timeout: Duration,
}

impl ExecutionStateManager {
    pub fn new() -> Self {
        Self::with_stale_timeout(defaults::STATE_STALE_TIMEOUT)
    }

    /// Create a manager with a custom stale timeout for [`Self::sweep_stale`]
    pub fn with_stale_timeout(stale_timeout: Duration) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            listeners: SubscriberTable::new(),
            stale_timeout,
        }
    }

    /// Build and register a snapshot for `execution`
    pub fn create_state(&self, execution: &DagExecution) -> ExecutionState {
        let state = ExecutionState::from_execution(execution);
        self.states.write().insert(
            execution.id.clone(),
            Tracked {
                state: state.clone(),
                refreshed_at: Instant::now(),
            },
        );
        log::debug!("Tracking execution '{}'", execution.id);
        state
    }

    /// Refresh the snapshot for `execution` (creating it if needed) and
    /// notify its subscribers
    pub fn update_state(&self, execution: &DagExecution) -> ExecutionState {
        let state = {
            let mut states = self.states.write();
            match states.get_mut(&execution.id) {
                Some(tracked) => {
                    tracked.state.refresh(execution);
                    tracked.refreshed_at = Instant::now();
                    tracked.state.clone()
                }
                None => {
                    let state = ExecutionState::from_execution(execution);
                    states.insert(
                        execution.id.clone(),
                        Tracked {
                            state: state.clone(),
                            refreshed_at: Instant::now(),
                        },
                    );
                    state
                }
            }
        };

        self.listeners.notify(&execution.id, &state);
        state
    }

    pub fn get_state(&self, execution_id: &str) -> Option<ExecutionState> {
        self.states.read().get(execution_id).map(|t| t.state.clone())
    }

    /// All snapshots belonging to `workflow_id`
    pub fn get_workflow_states(&self, workflow_id: &str) -> Vec<ExecutionState> {
        self.states
            .read()
            .values()
            .filter(|t| t.state.workflow_id == workflow_id)
            .map(|t| t.state.clone())
            .collect()
    }

    /// Register `callback` for every update of `execution_id`
    pub fn subscribe<F>(&self, execution_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ExecutionState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(execution_id, callback)
    }

    /// Delete the snapshot and all subscribers of `execution_id`
    pub fn cleanup(&self, execution_id: &str) {
        self.states.write().remove(execution_id);
        self.listeners.remove_all(execution_id);
        log::debug!("Cleaned up execution state '{}'", execution_id);
    }

    /// Remove snapshots not refreshed within `max_age`, with their subscribers
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale_ids: Vec<String> = self
            .states
            .read()
            .iter()
            .filter(|(_, t)| now.duration_since(t.refreshed_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale_ids {
            self.cleanup(id);
            log::info!("Swept stale execution state '{}'", id);
        }
        stale_ids.len()
    }

    /// Periodically sweep with the configured stale timeout
    ///
    /// The task ends once the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_stale(manager.stale_timeout);
            }
        })
    }

    /// Statistics over all snapshots, or those of one workflow
    pub fn get_statistics(&self, workflow_id: Option<&str>) -> ExecutionStatistics {
        let states = self.states.read();
        let selected: Vec<&ExecutionState> = states
            .values()
            .map(|t| &t.state)
            .filter(|s| workflow_id.map_or(true, |w| s.workflow_id == w))
            .collect();

        let finished: Vec<&&ExecutionState> = selected
            .iter()
            .filter(|s| matches!(s.status, ExecutionStatus::Completed | ExecutionStatus::Failed))
            .collect();
        let succeeded = finished
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .count();
        let total_duration: i64 = finished
            .iter()
            .map(|s| s.metrics.duration_ms.unwrap_or(0))
            .sum();

        let (success_rate, average_duration_ms) = if finished.is_empty() {
            (0.0, 0.0)
        } else {
            let n = finished.len() as f64;
            (succeeded as f64 / n * 100.0, total_duration as f64 / n)
        };

        ExecutionStatistics {
            total_executions: finished.len(),
            success_rate,
            average_duration_ms,
            total_tokens: selected.iter().map(|s| s.metrics.total_tokens).sum(),
            total_cost: selected.iter().map(|s| s.metrics.total_cost).sum(),
        }
    }
}

impl Default for ExecutionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
        _ => None,
    }
}
