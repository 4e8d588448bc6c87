//! The `Execution` aggregate root and its state machine, plus the
//! `NodeExecution` records it owns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::context::ExecutionContext;
use crate::engine::error::ExecutionError;
use crate::graph::node::NodeStatus;

/// Lifecycle status of an [`Execution`]. The last three variants are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Created, not yet started.
    Pending,
    /// Traversal in progress.
    Running,
    /// Reached an `End` node / traversal finished with no error.
    Completed,
    /// A non-recoverable error terminated the run.
    Failed,
    /// Cancellation was observed before completion.
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// The record of one node's run within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Fresh UUID.
    pub id: String,
    /// Owning execution's ID.
    pub execution_id: String,
    /// Node ID from the workflow definition.
    pub node_id: String,
    /// Node type tag (`"start"`, `"mcp_tool"`, ...).
    pub node_type: String,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// When the node started, if it has.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When the node reached a terminal status, if it has.
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Inputs recorded at dispatch time.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Outputs recorded at completion.
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Terminal error, if `status == Failed`.
    pub error: Option<ExecutionError>,
    /// Number of retries consumed before this record reached its terminal
    /// status (0 if it was never wrapped in a retry executor, or succeeded
    /// on the first attempt).
    pub retry_count: u32,
}

impl NodeExecution {
    /// A freshly created, `Pending` node-execution record.
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            inputs: serde_json::Map::new(),
            outputs: serde_json::Map::new(),
            error: None,
            retry_count: 0,
        }
    }

    /// Move `Pending -> Running`, stamping `started_at`.
    pub fn start(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(chrono::Utc::now());
    }

    /// Move `Running -> Completed` with the given outputs.
    pub fn complete(&mut self, outputs: serde_json::Map<String, serde_json::Value>) {
        self.status = NodeStatus::Completed;
        self.outputs = outputs;
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Move `Running -> Failed` with the given error.
    pub fn fail(&mut self, error: ExecutionError) {
        self.status = NodeStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Move directly to `Skipped` (a condition branch not taken, or a node
    /// bypassed by cancellation).
    pub fn skip(&mut self) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Wall-clock duration; zero until terminal.
    pub fn duration(&self) -> chrono::Duration {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end - start,
            _ => chrono::Duration::zero(),
        }
    }
}

/// Error returned when a disallowed status transition is attempted. The
/// execution's state is left unchanged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot transition execution from {from:?} via {operation}")]
pub struct InvalidTransition {
    /// Status the execution was in.
    pub from: ExecutionStatus,
    /// Operation that was rejected.
    pub operation: &'static str,
}

/// The aggregate root: one run of a workflow against one input mapping. Owns
/// its [`ExecutionContext`] and the ordered list of [`NodeExecution`]s
/// exclusively.
pub struct Execution {
    /// Fresh UUID.
    pub id: String,
    /// Workflow ID this execution ran.
    pub workflow_id: String,
    /// Workflow version.
    pub workflow_version: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When `start()` was called.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When a terminal status was reached.
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Terminal error, set only on `Failed`.
    pub error: Option<ExecutionError>,
    /// The value an `End` node resolved, if any.
    pub return_value: Option<serde_json::Value>,
    /// Node-execution records, in dispatch order. Mutated only by the
    /// scheduler task.
    pub node_executions: Vec<NodeExecution>,
    /// The owned, thread-safe variable context.
    pub context: ExecutionContext,
}

impl Execution {
    /// A freshly created, `Pending` execution.
    pub fn new(workflow_id: impl Into<String>, workflow_version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            return_value: None,
            node_executions: Vec::new(),
            context: ExecutionContext::new(),
        }
    }

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        if self.status != ExecutionStatus::Pending {
            return Err(InvalidTransition {
                from: self.status,
                operation: "Start",
            });
        }
        self.status = ExecutionStatus::Running;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Running -> Completed`. Idempotent calls on an already-terminal
    /// execution are rejected and leave state unchanged.
    pub fn complete(&mut self, return_value: Option<serde_json::Value>) -> Result<(), InvalidTransition> {
        if self.status != ExecutionStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                operation: "Complete",
            });
        }
        self.status = ExecutionStatus::Completed;
        self.return_value = return_value;
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Running -> Failed`.
    pub fn fail(&mut self, error: ExecutionError) -> Result<(), InvalidTransition> {
        if self.status != ExecutionStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                operation: "Fail",
            });
        }
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Running -> Cancelled`.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        if self.status != ExecutionStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                operation: "Cancel",
            });
        }
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Append a node-execution record. Only permitted while `Running`.
    pub fn add_node_execution(&mut self, ne: NodeExecution) -> Result<(), InvalidTransition> {
        if self.status != ExecutionStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                operation: "AddNodeExecution",
            });
        }
        self.node_executions.push(ne);
        Ok(())
    }

    /// Wall-clock duration; zero until terminal.
    pub fn duration(&self) -> chrono::Duration {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if self.status.is_terminal() => end - start,
            _ => chrono::Duration::zero(),
        }
    }
}
