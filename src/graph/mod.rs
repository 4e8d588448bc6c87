//! Workflow graph: node/edge data model, validation, and the two traversal
//! primitives the scheduler builds on (topological order, edge lookup).

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod edge;
pub mod node;

pub use edge::Edge;
pub use node::{Node, NodeKind, NodeStatus};

/// Errors from graph construction and traversal.
#[derive(Error, Debug)]
pub enum GraphError {
    /// An edge or lookup referenced a node ID that doesn't exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The workflow defines more than one node with the same ID.
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// No `start` node, or more than one.
    #[error("workflow must have exactly one start node")]
    MissingStart,

    /// A cycle was found where the traversal mode requires a DAG.
    #[error("cycle detected in workflow graph")]
    CycleDetected,

    /// Catch-all for structural problems not covered above.
    #[error("invalid graph structure: {0}")]
    InvalidStructure(String),
}

/// A variable declaration: name, and an optional default value merged in
/// before an execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    /// Variable name.
    pub name: String,
    /// Default value, used when the caller's input mapping omits `name`.
    pub default: Option<serde_json::Value>,
}

/// A tool server the workflow depends on. Connection lifecycle and the wire
/// protocol are out of scope here; this is just the declaration the
/// scheduler walks in order when opening connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    /// ID used by `Tool` nodes to look this server up in the registry.
    pub id: String,
    /// Opaque connection descriptor (address, transport, etc.).
    pub descriptor: serde_json::Value,
}

/// A validated workflow definition: nodes, edges, variable defaults, and the
/// tool servers it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow ID.
    pub id: String,
    /// Workflow version, carried through to `Execution` for audit purposes.
    pub version: String,
    /// Nodes, in declaration order.
    pub nodes: Vec<Node>,
    /// Directed edges between node IDs.
    pub edges: Vec<Edge>,
    /// Declared variables and their defaults.
    pub variables: Vec<VariableDef>,
    /// Tool servers, opened in this order by the scheduler.
    pub tool_servers: Vec<ToolServerDescriptor>,
}

impl Workflow {
    /// Look up a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Merge the caller's input mapping with declared variable defaults.
    /// Caller-provided values win.
    pub fn merge_defaults(
        &self,
        mut input: serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        for var in &self.variables {
            if !input.contains_key(&var.name) {
                if let Some(default) = &var.default {
                    input.insert(var.name.clone(), default.clone());
                }
            }
        }
        input
    }

    /// Build and validate the executable graph.
    pub fn compile(&self) -> Result<WorkflowGraph, GraphError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let start_count = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        if start_count != 1 {
            return Err(GraphError::MissingStart);
        }

        // Nodes owned by a `Parallel` branch or a `Loop` body are dispatched
        // recursively by the node that owns them, not by the top-level
        // traversal, so they're excluded from the graph itself (they stay
        // reachable through `get_node` for that recursive lookup).
        let mut body_owned = std::collections::HashSet::new();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Parallel { branches, .. } => {
                    body_owned.extend(branches.iter().flatten().map(String::as_str));
                }
                NodeKind::Loop { body, .. } => {
                    body_owned.extend(body.iter().map(String::as_str));
                }
                _ => {}
            }
        }

        let mut graph = DiGraph::<String, Edge>::new();
        let mut node_map = HashMap::new();
        for node in &self.nodes {
            if body_owned.contains(node.id.as_str()) {
                continue;
            }
            let idx = graph.add_node(node.id.clone());
            node_map.insert(node.id.clone(), idx);
        }

        for edge in &self.edges {
            let from = *node_map
                .get(&edge.from)
                .ok_or_else(|| GraphError::NodeNotFound(edge.from.clone()))?;
            let to = *node_map
                .get(&edge.to)
                .ok_or_else(|| GraphError::NodeNotFound(edge.to.clone()))?;
            graph.add_edge(from, to, edge.clone());
        }

        let start_id = self
            .nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
            .map(|n| n.id.clone())
            .ok_or(GraphError::MissingStart)?;

        Ok(WorkflowGraph {
            graph,
            node_map,
            start_id,
        })
    }

    /// True if any node is a `Condition` node, which forces edge-directed
    /// traversal (see the scheduler's mode-selection rule).
    pub fn has_condition_node(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Condition { .. }))
    }
}

/// The compiled, validated executable form of a [`Workflow`]'s shape. Owns
/// only topology (node IDs and edges); node behavior stays on `Workflow`.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<String, Edge>,
    node_map: HashMap<String, NodeIndex>,
    start_id: String,
}

impl WorkflowGraph {
    /// The single `start` node's ID.
    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// True if the graph contains a directed cycle.
    pub fn has_cycles(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Outgoing edges from a node, in declaration order.
    pub fn edges_from(&self, node_id: &str) -> Vec<&Edge> {
        match self.node_map.get(node_id) {
            Some(&idx) => {
                let mut out: Vec<(usize, &Edge)> = self
                    .graph
                    .edges(idx)
                    .map(|e| (e.id().index(), e.weight()))
                    .collect();
                out.sort_by_key(|(id, _)| *id);
                out.into_iter().map(|(_, e)| e).collect()
            }
            None => Vec::new(),
        }
    }

    /// Kahn's-algorithm topological order of node IDs. Errors if the graph
    /// has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].clone()).collect())
            .map_err(|_| GraphError::CycleDetected)
    }
}
