//! Bounded, per-node variable snapshot history, separate from the
//! context-wide variable history kept in [`crate::engine::context`].

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A deep-copied variable snapshot taken right after one node finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVariableSnapshot {
    /// Node the snapshot was taken after.
    pub node_id: String,
    /// When it was taken.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Deep-copied variable mapping at that point.
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Retention policy for a node's snapshot history.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Maximum snapshots kept per node; oldest are dropped first.
    pub max_count: usize,
    /// Maximum age a snapshot is kept before it's pruned.
    pub max_age: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 50,
            max_age: chrono::Duration::hours(1),
        }
    }
}

/// Keeps a bounded, per-node ring of variable snapshots for inspection after
/// the fact (e.g. "what did the variables look like right after node X ran
/// three iterations ago").
pub struct SnapshotManager {
    policy: RetentionPolicy,
    by_node: Mutex<HashMap<String, VecDeque<NodeVariableSnapshot>>>,
}

impl SnapshotManager {
    /// A manager using the default retention policy.
    pub fn new() -> Self {
        Self::with_policy(RetentionPolicy::default())
    }

    /// A manager using a caller-chosen retention policy.
    pub fn with_policy(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            by_node: Mutex::new(HashMap::new()),
        }
    }

    /// Record a snapshot for `node_id`, pruning by count and age.
    pub fn record(&self, node_id: &str, variables: serde_json::Map<String, serde_json::Value>) {
        let now = chrono::Utc::now();
        let mut by_node = self.by_node.lock();
        let ring = by_node.entry(node_id.to_string()).or_default();
        ring.push_back(NodeVariableSnapshot {
            node_id: node_id.to_string(),
            timestamp: now,
            variables,
        });
        while ring.len() > self.policy.max_count {
            ring.pop_front();
        }
        while ring
            .front()
            .map(|s| now - s.timestamp > self.policy.max_age)
            .unwrap_or(false)
        {
            ring.pop_front();
        }
    }

    /// Every retained snapshot for `node_id`, oldest first.
    pub fn history_for(&self, node_id: &str) -> Vec<NodeVariableSnapshot> {
        self.by_node
            .lock()
            .get(node_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent snapshot for `node_id`, if any.
    pub fn latest_for(&self, node_id: &str) -> Option<NodeVariableSnapshot> {
        self.by_node.lock().get(node_id).and_then(|ring| ring.back().cloned())
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}
