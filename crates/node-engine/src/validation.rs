//! Graph validation for workflow graphs
//!
//! Validates node identity, dependency references, node types, and detects
//! cycles. Dependencies come from both `dependsOn` lists and edges.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::registry::ProcessorRegistry;
use crate::types::{NodeId, WorkflowGraph};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Cycle detected in the graph
    CycleDetected { nodes: Vec<NodeId> },
    /// Two nodes share an id
    DuplicateNodeId { node_id: NodeId },
    /// A node has an unknown type (not in registry)
    UnknownNodeType { node_id: NodeId, node_type: String },
    /// An edge references a non-existent node
    UnknownNode { edge_id: String, node_id: NodeId },
    /// A `dependsOn` entry references a non-existent node
    UnknownDependency { node_id: NodeId, dependency: NodeId },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleDetected { nodes } => {
                write!(f, "Cycle detected in graph involving: {}", nodes.join(", "))
            }
            Self::DuplicateNodeId { node_id } => write!(f, "Duplicate node id '{}'", node_id),
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "Unknown node type '{}' for node '{}'", node_type, node_id)
            }
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "Edge '{}' references unknown node '{}'", edge_id, node_id)
            }
            Self::UnknownDependency { node_id, dependency } => {
                write!(
                    f,
                    "Node '{}' depends on unknown node '{}'",
                    node_id, dependency
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a workflow graph
///
/// Returns all validation errors found (not just the first).
/// Pass a registry to enable node type validation.
pub fn validate_workflow(
    graph: &WorkflowGraph,
    registry: Option<&ProcessorRegistry>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_unique_ids(graph, &mut errors);
    validate_references(graph, &mut errors);
    if let Err(cycle) = topological_order(graph) {
        errors.push(cycle);
    }

    if let Some(reg) = registry {
        validate_node_types(graph, reg, &mut errors);
    }

    errors
}

/// Compute an execution order using Kahn's algorithm
///
/// Ties are broken by declaration order, so the same graph always yields the
/// same order. References to unknown nodes are ignored here; they are
/// reported by [`validate_workflow`].
pub fn topological_order(graph: &WorkflowGraph) -> Result<Vec<NodeId>, ValidationError> {
    let known: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    let deps: Vec<(&str, Vec<NodeId>)> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), graph.dependencies_of(&n.id)))
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &graph.nodes {
        in_degree.entry(node.id.as_str()).or_insert(0);
    }
    for (node_id, node_deps) in &deps {
        for dep in node_deps.iter().filter(|d| known.contains(d.as_str())) {
            *in_degree.entry(*node_id).or_insert(0) += 1;
            downstream.entry(dep.as_str()).or_default().push(*node_id);
        }
    }

    let mut queue: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        order.push(node_id.to_string());
        for next in downstream.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if order.len() < known.len() {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| !visited.contains(id.as_str()))
            .collect();
        return Err(ValidationError::CycleDetected { nodes });
    }

    Ok(order)
}

fn validate_unique_ids(graph: &WorkflowGraph, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }
}

/// Check that all edge endpoints and `dependsOn` entries exist
fn validate_references(graph: &WorkflowGraph, errors: &mut Vec<ValidationError>) {
    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }

    for node in &graph.nodes {
        for dep in &node.depends_on {
            if !node_ids.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    node_id: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
}

/// Check that all nodes have a processor in the registry
fn validate_node_types(
    graph: &WorkflowGraph,
    registry: &ProcessorRegistry,
    errors: &mut Vec<ValidationError>,
) {
    for node in &graph.nodes {
        if !registry.has_node_type(&node.node_type) {
            errors.push(ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
        }
    }
}
