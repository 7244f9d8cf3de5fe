// [[AXON]]/apps/kernel-server/src/dag.rs
// Purpose: DAG scheduling over canvas nodes/edges. Topological order + parent lookup.
// Architecture: Core Data Structure
// Dependencies: std, thiserror

use crate::models::{CanvasEdge, CanvasNode};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DagError {
    /// Carries every node that could not be scheduled; this set is always
    /// a superset of at least one cycle.
    #[error("workflow contains a cycle involving nodes: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
}

/// Compute execution order via Kahn's algorithm (BFS topological sort).
///
/// Edges referencing unknown node IDs are ignored so stale canvas data
/// cannot poison a run. Ties between simultaneously-ready nodes resolve
/// in node declaration order, which keeps the result stable for a given
/// canvas.
pub fn topological_sort(
    nodes: &[CanvasNode],
    edges: &[CanvasEdge],
) -> Result<Vec<String>, DagError> {
    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges {
        if in_degree.contains_key(edge.source.as_str())
            && in_degree.contains_key(edge.target.as_str())
        {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
            *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(nodes.len());

    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.to_string());

        if let Some(neighbors) = adjacency.get(node_id) {
            for neighbor in neighbors {
                let degree = in_degree.get_mut(neighbor).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let mut remaining: Vec<String> = nodes
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| !order.contains(id))
            .collect();
        remaining.sort();
        return Err(DagError::CycleDetected(remaining));
    }

    Ok(order)
}

/// Get the IDs of all nodes that feed into the given node, preserving
/// edge insertion order (the canvas decides what "first parent" means).
pub fn node_dependencies(node_id: &str, edges: &[CanvasEdge]) -> Vec<String> {
    edges
        .iter()
        .filter(|e| e.target == node_id)
        .map(|e| e.source.clone())
        .collect()
}
