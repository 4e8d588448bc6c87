//! Atomic progress tracking: O(1) reads, monotonically non-decreasing
//! percentage, a single narrow mutex for the current-node slot.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::execution::Execution;
use crate::graph::node::NodeStatus;

/// A point-in-time read of an execution's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Total nodes expected to run.
    pub total: u64,
    /// Nodes that finished successfully.
    pub completed: u64,
    /// Nodes that finished with an error.
    pub failed: u64,
    /// Nodes that were skipped.
    pub skipped: u64,
    /// The node currently executing, if any.
    pub current: Option<String>,
    /// `(completed + failed + skipped) / total * 100`, capped at 100.
    pub percent: f64,
}

/// Owned per execution. Counters are plain atomics; only the current-node
/// slot and cached percentage sit behind a mutex, and that mutex is never
/// held across an await point.
pub struct ProgressTracker {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    current: Mutex<Option<String>>,
    percent: Mutex<f64>,
}

impl ProgressTracker {
    /// Create a tracker for an execution expected to run `total` nodes.
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            current: Mutex::new(None),
            percent: Mutex::new(0.0),
        }
    }

    /// Record that `id` started; becomes the current-node slot.
    pub fn on_node_started(&self, id: &str) {
        *self.current.lock() = Some(id.to_string());
    }

    /// Record that `id` completed successfully.
    pub fn on_node_completed(&self, id: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.clear_current_if_matches(id);
        self.recompute_percent();
    }

    /// Record that `id` failed.
    pub fn on_node_failed(&self, id: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.clear_current_if_matches(id);
        self.recompute_percent();
    }

    /// Record that `id` was skipped.
    pub fn on_node_skipped(&self, id: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.clear_current_if_matches(id);
        self.recompute_percent();
    }

    fn clear_current_if_matches(&self, id: &str) {
        let mut current = self.current.lock();
        if current.as_deref() == Some(id) {
            *current = None;
        }
    }

    fn recompute_percent(&self) {
        let total = self.total.load(Ordering::SeqCst);
        let done = self.completed.load(Ordering::SeqCst)
            + self.failed.load(Ordering::SeqCst)
            + self.skipped.load(Ordering::SeqCst);
        let raw = if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64) * 100.0
        };
        let capped = raw.min(100.0);
        let mut percent = self.percent.lock();
        // Percentage must never decrease even if counters are recomputed
        // out of order by concurrent callers.
        if capped > *percent {
            *percent = capped;
        }
    }

    /// O(1) read of the current progress.
    pub fn get_progress(&self) -> Progress {
        Progress {
            total: self.total.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            current: self.current.lock().clone(),
            percent: *self.percent.lock(),
        }
    }

    /// Zero every counter and the cached percentage.
    pub fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        *self.current.lock() = None;
        *self.percent.lock() = 0.0;
    }

    /// Rebuild every counter from an execution's node-execution list. Used
    /// to resync a tracker against persisted state (e.g. after resumption).
    pub fn update_from_execution(&self, execution: &Execution) {
        self.reset();
        self.total.store(execution.node_executions.len() as u64, Ordering::SeqCst);
        for ne in &execution.node_executions {
            match ne.status {
                NodeStatus::Completed => {
                    self.completed.fetch_add(1, Ordering::SeqCst);
                }
                NodeStatus::Failed => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                }
                NodeStatus::Skipped => {
                    self.skipped.fetch_add(1, Ordering::SeqCst);
                }
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        self.recompute_percent();
    }
}
