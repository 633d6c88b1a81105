//! Performance monitor
//!
//! Records per-node timings and usage for each execution and rolls them up
//! into live aggregates: success and cache hit rates, throughput, and an
//! estimated completion time. A node is flagged as a bottleneck when its
//! duration exceeds twice the average completed-node duration.
//!
//! A per-node history spans executions and keeps the most recent
//! [`HISTORY_LIMIT`] runs of each node id.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::processor::ResultMetadata;
use crate::subscribers::{SubscriberTable, Subscription};

/// Runs kept per node id in the history
pub const HISTORY_LIMIT: usize = 100;

/// A duration above this multiple of the average marks a bottleneck
const BOTTLENECK_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRunOutcome {
    Running,
    Completed,
    Failed,
    /// Completed from the cache
    Cached,
}

/// Measurements for one node run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePerformance {
    pub node_id: String,
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: NodeRunOutcome,
    pub tokens_used: Option<u64>,
    pub cost: Option<f64>,
    pub cache_hit: bool,
    pub retry_count: u32,
    pub memory_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPerformance {
    pub total_nodes: usize,
    /// Includes cached nodes
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub cached_nodes: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Mean over completed nodes with a non-zero duration
    pub average_node_duration_ms: f64,
    /// Completed nodes as a percentage of all nodes
    pub success_rate: f64,
    /// Cached nodes as a percentage of nodes started so far
    pub cache_hit_rate: f64,
    pub throughput_per_second: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveProgress {
    pub currently_running: Vec<String>,
    pub queued_nodes: Vec<String>,
    pub bottlenecks: Vec<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Performance view of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPerformance {
    pub execution_id: String,
    pub workflow_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub nodes: BTreeMap<String, NodePerformance>,
    pub aggregated: AggregatedPerformance,
    pub live: LiveProgress,
}

struct Monitored {
    perf: ExecutionPerformance,
    started: Instant,
    ended: Option<Instant>,
    node_started: HashMap<String, Instant>,
}

impl Monitored {
    fn refresh(&mut self) {
        let perf = &mut self.perf;
        let agg = &mut perf.aggregated;

        let completed: Vec<&NodePerformance> = perf
            .nodes
            .values()
            .filter(|n| matches!(n.status, NodeRunOutcome::Completed | NodeRunOutcome::Cached))
            .collect();
        agg.completed_nodes = completed.len();
        agg.failed_nodes = perf
            .nodes
            .values()
            .filter(|n| n.status == NodeRunOutcome::Failed)
            .count();
        agg.cached_nodes = perf
            .nodes
            .values()
            .filter(|n| n.status == NodeRunOutcome::Cached)
            .count();
        agg.total_tokens = perf.nodes.values().filter_map(|n| n.tokens_used).sum();
        agg.total_cost = perf.nodes.values().filter_map(|n| n.cost).sum();

        let durations: Vec<u64> = completed
            .iter()
            .filter_map(|n| n.duration_ms)
            .filter(|d| *d > 0)
            .collect();
        agg.average_node_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        agg.success_rate = percentage(agg.completed_nodes, agg.total_nodes);
        agg.cache_hit_rate = percentage(agg.cached_nodes, perf.nodes.len());

        let elapsed = self.ended.unwrap_or_else(Instant::now) - self.started;
        agg.throughput_per_second = if elapsed.is_zero() {
            0.0
        } else {
            agg.completed_nodes as f64 / elapsed.as_secs_f64()
        };

        let live = &mut perf.live;
        if !live.currently_running.is_empty() && agg.average_node_duration_ms > 0.0 {
            let remaining = live.queued_nodes.len() + live.currently_running.len();
            let eta_ms = (remaining as f64 * agg.average_node_duration_ms) as i64;
            live.estimated_completion = Some(Utc::now() + chrono::Duration::milliseconds(eta_ms));
        }
    }

    fn detect_bottlenecks(&mut self) {
        let threshold = self.perf.aggregated.average_node_duration_ms * BOTTLENECK_FACTOR;
        self.perf.live.bottlenecks = self
            .perf
            .nodes
            .values()
            .filter(|n| n.duration_ms.is_some_and(|d| d > 0 && d as f64 > threshold))
            .map(|n| n.node_id.clone())
            .collect();
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub struct PerformanceMonitor {
    executions: RwLock<HashMap<String, Monitored>>,
    history: RwLock<HashMap<String, VecDeque<NodePerformance>>>,
    listeners: SubscriberTable<ExecutionPerformance>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            listeners: SubscriberTable::new(),
        }
    }

    /// Begin tracking an execution; every node starts out queued
    pub fn start_monitoring(&self, execution_id: &str, workflow_id: &str, node_ids: &[String]) {
        let perf = ExecutionPerformance {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: None,
            nodes: BTreeMap::new(),
            aggregated: AggregatedPerformance {
                total_nodes: node_ids.len(),
                ..Default::default()
            },
            live: LiveProgress {
                queued_nodes: node_ids.to_vec(),
                ..Default::default()
            },
        };
        self.executions.write().insert(
            execution_id.to_string(),
            Monitored {
                perf,
                started: Instant::now(),
                ended: None,
                node_started: HashMap::new(),
            },
        );
        log::debug!("Monitoring execution '{}'", execution_id);
    }

    pub fn record_node_start(&self, execution_id: &str, node_id: &str) {
        let snapshot = {
            let mut executions = self.executions.write();
            let Some(monitored) = executions.get_mut(execution_id) else {
                return;
            };
            monitored.node_started.insert(node_id.to_string(), Instant::now());
            monitored.perf.nodes.insert(
                node_id.to_string(),
                NodePerformance {
                    node_id: node_id.to_string(),
                    execution_id: execution_id.to_string(),
                    start_time: Utc::now(),
                    end_time: None,
                    duration_ms: None,
                    status: NodeRunOutcome::Running,
                    tokens_used: None,
                    cost: None,
                    cache_hit: false,
                    retry_count: 0,
                    memory_usage: None,
                },
            );
            let live = &mut monitored.perf.live;
            live.currently_running.push(node_id.to_string());
            live.queued_nodes.retain(|id| id != node_id);

            monitored.refresh();
            monitored.perf.clone()
        };
        self.listeners.notify(execution_id, &snapshot);
    }

    /// Close out a started node; `metadata` carries tokens, cost, cache and
    /// retry information from its result
    pub fn record_node_completion(
        &self,
        execution_id: &str,
        node_id: &str,
        success: bool,
        metadata: Option<&ResultMetadata>,
    ) {
        let (snapshot, finished) = {
            let mut executions = self.executions.write();
            let Some(monitored) = executions.get_mut(execution_id) else {
                return;
            };
            let Some(started) = monitored.node_started.get(node_id).copied() else {
                return;
            };
            let Some(node) = monitored.perf.nodes.get_mut(node_id) else {
                return;
            };

            node.end_time = Some(Utc::now());
            node.duration_ms = Some(started.elapsed().as_millis() as u64);
            node.status = if success {
                NodeRunOutcome::Completed
            } else {
                NodeRunOutcome::Failed
            };
            if let Some(meta) = metadata {
                node.tokens_used = meta.tokens_used;
                node.cost = meta.cost;
                node.cache_hit = meta.cache_hit;
                node.retry_count = meta.retry_count;
                node.memory_usage = meta.memory_usage;
                if success && meta.cache_hit {
                    node.status = NodeRunOutcome::Cached;
                }
            }
            let finished = node.clone();

            monitored.perf.live.currently_running.retain(|id| id != node_id);
            monitored.refresh();
            monitored.detect_bottlenecks();
            if monitored.perf.live.bottlenecks.iter().any(|id| id == node_id) {
                log::debug!(
                    "Node '{}' is a bottleneck in execution '{}' ({}ms)",
                    node_id,
                    execution_id,
                    finished.duration_ms.unwrap_or(0)
                );
            }
            (monitored.perf.clone(), finished)
        };

        {
            let mut history = self.history.write();
            let runs = history.entry(node_id.to_string()).or_default();
            runs.push_back(finished);
            while runs.len() > HISTORY_LIMIT {
                runs.pop_front();
            }
        }
        self.listeners.notify(execution_id, &snapshot);
    }

    /// Stamp the end time and return the final view
    ///
    /// The view stays readable until [`cleanup`](Self::cleanup).
    pub fn stop_monitoring(&self, execution_id: &str) -> Option<ExecutionPerformance> {
        let mut executions = self.executions.write();
        let monitored = executions.get_mut(execution_id)?;
        let now = Instant::now();
        monitored.ended = Some(now);
        monitored.perf.end_time = Some(Utc::now());
        monitored.perf.total_duration_ms = Some((now - monitored.started).as_millis() as u64);
        monitored.refresh();
        Some(monitored.perf.clone())
    }

    pub fn get_execution_metrics(&self, execution_id: &str) -> Option<ExecutionPerformance> {
        self.executions
            .read()
            .get(execution_id)
            .map(|m| m.perf.clone())
    }

    /// Most recent runs of `node_id` across executions, oldest first
    pub fn node_history(&self, node_id: &str) -> Vec<NodePerformance> {
        self.history
            .read()
            .get(node_id)
            .map(|runs| runs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `callback` for every change to `execution_id`
    pub fn subscribe<F>(&self, execution_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ExecutionPerformance) + Send + Sync + 'static,
    {
        self.listeners.subscribe(execution_id, callback)
    }

    /// Forget an execution and its subscribers; node history is kept
    pub fn cleanup(&self, execution_id: &str) {
        self.executions.write().remove(execution_id);
        self.listeners.remove_all(execution_id);
        log::debug!("Cleaned up performance metrics for '{}'", execution_id);
    }

    /// Periodically refresh and publish every execution still being monitored
    ///
    /// The task ends once the monitor is dropped.
    pub fn spawn_updates(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.publish_running();
            }
        })
    }

    fn publish_running(&self) {
        let snapshots: Vec<ExecutionPerformance> = self
            .executions
            .write()
            .values_mut()
            .filter(|m| m.ended.is_none())
            .map(|m| {
                m.refresh();
                m.perf.clone()
            })
            .collect();

        for snapshot in snapshots {
            self.listeners.notify(&snapshot.execution_id, &snapshot);
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn meta(tokens: u64, cost: f64, cache_hit: bool, retries: u32) -> ResultMetadata {
        ResultMetadata {
            tokens_used: Some(tokens),
            cost: Some(cost),
            cache_hit,
            retry_count: retries,
            ..Default::default()
        }
    }

    async fn run_node(monitor: &PerformanceMonitor, exec: &str, node: &str, ms: u64, success: bool, m: ResultMetadata) {
        monitor.record_node_start(exec, node);
        tokio::time::advance(Duration::from_millis(ms)).await;
        monitor.record_node_completion(exec, node, success, Some(&m));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregates_over_a_run() {
        let monitor = PerformanceMonitor::new();
        monitor.start_monitoring("e1", "wf", &ids(&["a", "b", "c", "d"]));

        run_node(&monitor, "e1", "a", 100, true, meta(1000, 0.01, false, 2)).await;
        run_node(&monitor, "e1", "b", 300, true, meta(500, 0.005, false, 0)).await;
        run_node(&monitor, "e1", "c", 0, true, meta(0, 0.0, true, 0)).await;
        run_node(&monitor, "e1", "d", 50, false, ResultMetadata::default()).await;

        let perf = monitor.stop_monitoring("e1").unwrap();
        let agg = &perf.aggregated;
        assert_eq!(agg.total_nodes, 4);
        assert_eq!((agg.completed_nodes, agg.failed_nodes, agg.cached_nodes), (3, 1, 1));
        assert_eq!(agg.total_tokens, 1500);
        assert!((agg.total_cost - 0.015).abs() < 1e-12);
        // cached node has zero duration and is left out of the mean
        assert!((agg.average_node_duration_ms - 200.0).abs() < 1e-9);
        assert!((agg.success_rate - 75.0).abs() < 1e-9);
        assert!((agg.cache_hit_rate - 25.0).abs() < 1e-9);
        assert!((agg.throughput_per_second - 3.0 / 0.45).abs() < 1e-6);

        assert_eq!(perf.total_duration_ms, Some(450));
        assert_eq!(perf.nodes["a"].retry_count, 2);
        assert_eq!(perf.nodes["c"].status, NodeRunOutcome::Cached);
        assert_eq!(perf.nodes["d"].status, NodeRunOutcome::Failed);
        assert!(perf.live.queued_nodes.is_empty());
        assert!(perf.live.currently_running.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_node_flagged_as_bottleneck() {
        let monitor = PerformanceMonitor::new();
        monitor.start_monitoring("e1", "wf", &ids(&["fast1", "fast2", "slow"]));

        run_node(&monitor, "e1", "fast1", 100, true, meta(0, 0.0, false, 0)).await;
        run_node(&monitor, "e1", "fast2", 100, true, meta(0, 0.0, false, 0)).await;
        run_node(&monitor, "e1", "slow", 1000, true, meta(0, 0.0, false, 0)).await;

        // average is 400ms, so only the 1000ms node exceeds twice that
        let perf = monitor.get_execution_metrics("e1").unwrap();
        assert_eq!(perf.live.bottlenecks, vec!["slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_completion_while_running() {
        let monitor = PerformanceMonitor::new();
        monitor.start_monitoring("e1", "wf", &ids(&["a", "b", "c"]));
        run_node(&monitor, "e1", "a", 200, true, meta(0, 0.0, false, 0)).await;

        let before = Utc::now();
        monitor.record_node_start("e1", "b");
        let perf = monitor.get_execution_metrics("e1").unwrap();

        assert_eq!(perf.live.currently_running, vec!["b"]);
        assert_eq!(perf.live.queued_nodes, vec!["c"]);
        let eta = perf.live.estimated_completion.unwrap();
        // two nodes left at 200ms each
        assert!(eta >= before + chrono::Duration::milliseconds(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped_per_node() {
        let monitor = PerformanceMonitor::new();
        for run in 0..(HISTORY_LIMIT + 5) {
            let exec = format!("e{}", run);
            monitor.start_monitoring(&exec, "wf", &ids(&["n"]));
            run_node(&monitor, &exec, "n", 10, true, meta(run as u64, 0.0, false, 0)).await;
            monitor.cleanup(&exec);
        }

        let history = monitor.node_history("n");
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].tokens_used, Some(5));
        assert_eq!(history[0].execution_id, "e5");
        assert!(monitor.node_history("unknown").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_execution_or_node_ignored() {
        let monitor = PerformanceMonitor::new();
        monitor.record_node_start("missing", "a");
        monitor.start_monitoring("e1", "wf", &ids(&["a"]));
        monitor.record_node_completion("e1", "never-started", true, None);

        let perf = monitor.get_execution_metrics("e1").unwrap();
        assert!(perf.nodes.is_empty());
        assert!(monitor.get_execution_metrics("missing").is_none());
        assert!(monitor.stop_monitoring("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_and_cleanup() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            monitor.subscribe("e1", move |perf| seen.lock().push(perf.aggregated.completed_nodes))
        };

        monitor.start_monitoring("e1", "wf", &ids(&["a"]));
        run_node(&monitor, "e1", "a", 10, true, meta(0, 0.0, false, 0)).await;
        assert_eq!(*seen.lock(), vec![0, 1]);

        // periodic updates only reach executions that are still running
        let ticker = monitor.spawn_updates(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(seen.lock().len(), 3);
        monitor.stop_monitoring("e1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(seen.lock().len(), 3);

        monitor.cleanup("e1");
        assert!(monitor.get_execution_metrics("e1").is_none());
        assert_eq!(monitor.node_history("a").len(), 1);

        drop(monitor);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ticker.is_finished());
    }
}
