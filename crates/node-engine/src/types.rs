//! Core types for workflow graphs and their executions
//!
//! A [`WorkflowGraph`] is the static definition coming from the editor or
//! storage layer. A [`DagExecution`] is one run of it, owned and mutated only
//! by the scheduler.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::processor::ResultMetadata;

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Built-in node type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    /// Injects static content into the graph
    Input,
    /// Calls a language-model provider
    AiModel,
    /// Transform / filter / branch / aggregate / validate
    Processing,
    /// Same operations as `Processing`, separate tag for the editor
    AdvancedProcessing,
    /// Formats upstream results as the workflow's final output
    Output,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Input,
        NodeKind::AiModel,
        NodeKind::Processing,
        NodeKind::AdvancedProcessing,
        NodeKind::Output,
    ];

    /// Parse a node type tag
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::AiModel => "aiModel",
            NodeKind::Processing => "processing",
            NodeKind::AdvancedProcessing => "advancedProcessing",
            NodeKind::Output => "output",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Unique identifier within the workflow
    pub id: NodeId,
    /// Type tag selecting the processor (see [`NodeKind`])
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific configuration, handed to the processor as "nodeData"
    #[serde(default)]
    pub data: serde_json::Value,
    /// Upstream node ids whose results become this node's inputs
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
            depends_on: Vec::new(),
        }
    }

    pub fn with_depends_on(mut self, upstream: &[&str]) -> Self {
        self.depends_on = upstream.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Per-node timeout override from `data.timeoutMs`
    pub fn timeout_override(&self) -> Option<Duration> {
        self.data
            .get("timeoutMs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
    }
}

/// A directed data dependency between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    /// Branch label ("true" / "false") this edge is conditional on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl GraphEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// A named DAG of nodes and edges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Parse a workflow definition from JSON
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    pub fn add_edge(&mut self, edge: GraphEdge) {
        self.edges.push(edge);
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Upstream ids of `node_id`: its `dependsOn` list followed by edge
    /// sources, without duplicates
    pub fn dependencies_of(&self, node_id: &str) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = Vec::new();
        let declared = self
            .find_node(node_id)
            .map(|n| n.depends_on.iter())
            .into_iter()
            .flatten();
        let from_edges = self
            .edges
            .iter()
            .filter(|e| e.target == node_id)
            .map(|e| &e.source);

        for dep in declared.chain(from_edges) {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        deps
    }

    /// Edges leaving `node_id`
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

/// Status of a single node within an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Overall status of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-node run state inside an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunState {
    pub id: NodeId,
    pub node_type: String,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub status: NodeStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque result payload
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: Option<ResultMetadata>,
}

impl NodeRunState {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            status: NodeStatus::Pending,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            metadata: None,
        }
    }
}

/// One run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub nodes: HashMap<NodeId, NodeRunState>,
    /// Topological order computed at creation
    pub execution_order: Vec<NodeId>,
    /// Node ids in flight right now
    pub current_batch: Vec<NodeId>,
    pub completed_nodes: HashSet<NodeId>,
    pub failed_nodes: HashSet<NodeId>,
}

impl DagExecution {
    /// Build a pending execution from a graph and its topological order
    pub fn new(id: impl Into<String>, graph: &WorkflowGraph, execution_order: Vec<NodeId>) -> Self {
        let mut nodes: HashMap<NodeId, NodeRunState> = graph
            .nodes
            .iter()
            .map(|n| {
                let mut state = NodeRunState::new(&n.id, &n.node_type);
                state.dependencies = graph.dependencies_of(&n.id);
                (n.id.clone(), state)
            })
            .collect();

        for node_id in &execution_order {
            let deps = nodes
                .get(node_id)
                .map(|n| n.dependencies.clone())
                .unwrap_or_default();
            for dep in deps {
                if let Some(upstream) = nodes.get_mut(&dep) {
                    upstream.dependents.push(node_id.clone());
                }
            }
        }

        Self {
            id: id.into(),
            workflow_id: graph.id.clone(),
            status: ExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            nodes,
            execution_order,
            current_batch: Vec::new(),
            completed_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
        }
    }

    /// Number of nodes in a given status
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Wall-clock duration, if the execution has both timestamps
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
