//! Workflow graph: nodes, edges, validation, and execution order.
//!
//! The node/edge pair carries a freeform `config` object and named ports.
//! Validation rejects cycles and dangling edges before execution runs,
//! rather than running nodes in whatever order `petgraph::algo::toposort`
//! produces and letting a missing predecessor panic downstream.

use crate::error::{EngineError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub connector_type_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_port: Option<String>,
    #[serde(default)]
    pub target_port: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub workflow_id: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node id -> label, falling back to the id itself when no label is set.
    /// Used by the schema merger to name collision prefixes.
    pub fn node_labels(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .map(|n| {
                let label = if n.label.is_empty() { n.id.clone() } else { n.label.clone() };
                (n.id.clone(), label)
            })
            .collect()
    }

    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == node_id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Validate structural well-formedness: unique node ids, edges that
    /// reference existing nodes, no self-loops, and (done separately by
    /// `execution_order`) no cycles.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::InvalidGraph("graph has no nodes".to_string()));
        }

        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(EngineError::InvalidGraph("node id must not be empty".to_string()));
            }
            if !seen_ids.insert(node.id.as_str()) {
                return Err(EngineError::InvalidGraph(format!("duplicate node id '{}'", node.id)));
            }
        }

        for edge in &self.edges {
            if edge.source == edge.target {
                return Err(EngineError::InvalidGraph(format!(
                    "self-loop on node '{}'",
                    edge.source
                )));
            }
            if !seen_ids.contains(edge.source.as_str()) {
                return Err(EngineError::InvalidGraph(format!(
                    "edge references unknown source node '{}'",
                    edge.source
                )));
            }
            if !seen_ids.contains(edge.target.as_str()) {
                return Err(EngineError::InvalidGraph(format!(
                    "edge references unknown target node '{}'",
                    edge.target
                )));
            }
        }

        Ok(())
    }

    /// Compute a topological execution order via Kahn's algorithm
    /// (`petgraph::algo::toposort`). Returns node ids in an order where every
    /// node appears after all of its predecessors.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        self.validate()?;

        let mut graph = DiGraph::<&str, ()>::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.id.as_str());
            index_of.insert(node.id.as_str(), idx);
        }
        for edge in &self.edges {
            let source = index_of[edge.source.as_str()];
            let target = index_of[edge.target.as_str()];
            graph.add_edge(source, target, ());
        }

        toposort(&graph, None)
            .map(|order| order.into_iter().map(|idx| graph[idx].to_string()).collect())
            .map_err(|_| EngineError::CyclicGraph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> Node {
        Node { id: id.to_string(), connector_type_id: "noop".to_string(), label: String::new(), config: json!({}) }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge { source: source.to_string(), target: target.to_string(), source_port: None, target_port: None }
    }

    #[test]
    fn linear_graph_orders_predecessors_first() {
        let graph = WorkflowGraph {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![edge("a", "b"), edge("b", "c")],
            ..Default::default()
        };
        assert_eq!(graph.execution_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cyclic_graph_is_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("a", "b"), edge("b", "a")],
            ..Default::default()
        };
        assert!(matches!(graph.execution_order(), Err(EngineError::CyclicGraph)));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let graph = WorkflowGraph { nodes: vec![node("a")], edges: vec![edge("a", "missing")], ..Default::default() };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let graph = WorkflowGraph { nodes: vec![node("a"), node("a")], edges: vec![], ..Default::default() };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn self_loop_is_rejected() {
        let graph = WorkflowGraph { nodes: vec![node("a")], edges: vec![edge("a", "a")], ..Default::default() };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn empty_graph_is_rejected() {
        let graph = WorkflowGraph::default();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn node_labels_fall_back_to_id() {
        let mut n = node("a");
        n.label = "Users".to_string();
        let graph = WorkflowGraph { nodes: vec![n, node("b")], edges: vec![], ..Default::default() };
        let labels = graph.node_labels();
        assert_eq!(labels.get("a").unwrap(), "Users");
        assert_eq!(labels.get("b").unwrap(), "b");
    }
}
