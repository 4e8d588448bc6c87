//! Node types and per-kind configuration for the workflow graph.

use serde::{Deserialize, Serialize};

use crate::engine::parallel_executor::MergeStrategy;

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for the node, scoped to the workflow.
    pub id: String,

    /// The node's behavior and configuration.
    pub kind: NodeKind,

    /// Opaque metadata, untouched by the engine.
    pub metadata: Option<serde_json::Value>,
}

impl Node {
    /// Build a node with no metadata.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            metadata: None,
        }
    }

    /// Human-readable type tag, matching the well-known node types of §6.
    pub fn type_tag(&self) -> &'static str {
        match &self.kind {
            NodeKind::Start => "start",
            NodeKind::End { .. } => "end",
            NodeKind::Tool { .. } => "mcp_tool",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Parallel { .. } => "parallel",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Passthrough { .. } => "passthrough",
        }
    }
}

/// Discriminated node behavior. Each variant carries exactly the
/// configuration its executor needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// Entry point; performs no work.
    Start,

    /// Terminal node. If `return_expr` is set, it is resolved (`${var}` /
    /// `${var.path}` substitution) and stored as the execution's return value.
    End {
        /// Optional `${...}` expression to resolve into the return value.
        return_expr: Option<String>,
    },

    /// Invokes a named tool on a registered tool server.
    Tool {
        /// ID of the tool server to look up in the registry.
        server_id: String,
        /// Name of the tool to invoke on that server.
        tool_name: String,
        /// Parameters, each value may contain `${...}` placeholders.
        params: serde_json::Map<String, serde_json::Value>,
        /// Variable name to store the tool's result under.
        output_var: String,
    },

    /// Reads one variable, applies an expression or JSONPath, writes the
    /// result to another variable.
    Transform {
        /// Name of the input variable.
        input_var: String,
        /// Expression or JSONPath string.
        expression: String,
        /// Variable name to store the result under.
        output_var: String,
    },

    /// Evaluates a boolean expression; the scheduler picks the outgoing edge
    /// whose label matches the result.
    Condition {
        /// Boolean expression, evaluated against a variable snapshot.
        expression: String,
    },

    /// Fans out into concurrently executed branches.
    Parallel {
        /// Each branch is an ordered list of node IDs run sequentially
        /// against an isolated, deep-copied context.
        branches: Vec<Vec<String>>,
        /// How branch results and contexts are joined back into the parent.
        merge_strategy: MergeStrategy,
    },

    /// Iterates a collection variable, running body nodes per element.
    Loop {
        /// Name of the collection variable; must hold a JSON array.
        collection_var: String,
        /// Name the current element is bound to for each iteration.
        iteration_var: String,
        /// Node IDs run sequentially, in order, per iteration.
        body: Vec<String>,
        /// Optional expression; when true, the loop stops before running
        /// that iteration's body.
        break_condition: Option<String>,
    },

    /// Copies one variable to another unchanged. Performs no other work.
    Passthrough {
        /// Optional source variable name.
        input_var: Option<String>,
        /// Optional destination variable name.
        output_var: Option<String>,
    },
}

/// Lifecycle status of a single node's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Created, not yet dispatched.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Never ran (condition branch not taken, cancelled before start).
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses stop the node's own lifecycle (but not necessarily
    /// the whole execution).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}
