//! Edge type for the workflow graph.

use serde::{Deserialize, Serialize};

/// A directed edge between two nodes, with an optional label used to resolve
/// condition branches (`"true"` / `"false"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID.
    pub from: String,

    /// Target node ID.
    pub to: String,

    /// Optional label. Condition nodes route on this; all other nodes ignore
    /// it and every outgoing edge is followed.
    pub label: Option<String>,

    /// Optional metadata, opaque to the engine.
    pub metadata: Option<serde_json::Value>,
}

impl Edge {
    /// An unconditional edge.
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            metadata: None,
        }
    }

    /// An edge taken when a condition node's boolean result matches `label`
    /// (`"true"` or `"false"`).
    pub fn labeled(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: Some(label.into()),
            metadata: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
