//! A `dashmap`-backed [`ExecutionRepository`], grounded in the same
//! index-alongside-store shape as a sharded in-memory checkpoint store:
//! one map holding the records themselves, a second mapping workflow ID to
//! the execution IDs that belong to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::engine::context::ExecutionContext;
use crate::engine::error::ExecutionError;
use crate::engine::execution::{Execution, ExecutionStatus, NodeExecution};
use crate::engine::traits::{ExecutionRepository, ListOptions};

/// The serializable slice of an [`Execution`] that's actually persisted: its
/// live `ExecutionContext` is reduced to a variable snapshot, since the
/// context's lock can't be stored directly.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ExecutionRecord {
    id: String,
    workflow_id: String,
    workflow_version: String,
    status: ExecutionStatus,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    error: Option<ExecutionError>,
    return_value: Option<serde_json::Value>,
    node_executions: Vec<NodeExecution>,
    variables: serde_json::Map<String, serde_json::Value>,
    /// Monotonic save order, used to give `list` a stable "oldest first"
    /// ordering that survives `DashMap`'s unordered iteration.
    sequence: u64,
}

impl ExecutionRecord {
    async fn from_execution(execution: &Execution, sequence: u64) -> Self {
        Self {
            id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            workflow_version: execution.workflow_version.clone(),
            status: execution.status,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            error: execution.error.clone(),
            return_value: execution.return_value.clone(),
            node_executions: execution.node_executions.clone(),
            variables: execution.context.create_snapshot().await,
            sequence,
        }
    }

    async fn into_execution(self) -> Execution {
        Execution {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
            return_value: self.return_value,
            node_executions: self.node_executions,
            context: ExecutionContext::with_initial(self.variables).await,
        }
    }
}

/// An [`ExecutionRepository`] that keeps everything in memory, for tests and
/// single-process callers that don't need a durable backend.
#[derive(Clone, Default)]
pub struct InMemoryExecutionRepository {
    executions: Arc<DashMap<String, ExecutionRecord>>,
    by_workflow: Arc<DashMap<String, Vec<String>>>,
    /// Node-execution records saved incrementally via `save_node_execution`,
    /// keyed by owning execution ID. Authoritative over whatever
    /// `node_executions` list an `Execution` carried at its last `save`.
    node_executions: Arc<DashMap<String, Vec<NodeExecution>>>,
    /// Most recently saved full-variable snapshot per execution ID.
    variable_snapshots: Arc<DashMap<String, serde_json::Map<String, serde_json::Value>>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryExecutionRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self {
            executions: Arc::new(DashMap::new()),
            by_workflow: Arc::new(DashMap::new()),
            node_executions: Arc::new(DashMap::new()),
            variable_snapshots: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: &Execution) -> Result<(), ExecutionError> {
        let sequence = match self.executions.get(&execution.id) {
            Some(existing) => existing.sequence,
            None => self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        let record = ExecutionRecord::from_execution(execution, sequence).await;
        self.by_workflow
            .entry(record.workflow_id.clone())
            .or_default()
            .push(record.id.clone());
        self.executions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<Execution>, ExecutionError> {
        let Some(record) = self.executions.get(execution_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let mut execution = record.into_execution().await;
        if let Some(tracked) = self.node_executions.get(execution_id) {
            if !tracked.is_empty() {
                execution.node_executions = tracked.clone();
            }
        }
        Ok(Some(execution))
    }

    async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<String>, ExecutionError> {
        Ok(self
            .by_workflow
            .get(workflow_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default())
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<String>, ExecutionError> {
        Ok(self
            .executions
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<String>, ExecutionError> {
        let mut matches: Vec<(u64, String)> = self
            .executions
            .iter()
            .filter(|entry| {
                options
                    .workflow_id
                    .as_deref()
                    .map(|id| entry.value().workflow_id == id)
                    .unwrap_or(true)
            })
            .filter(|entry| options.status.map(|s| entry.value().status == s).unwrap_or(true))
            .map(|entry| (entry.value().sequence, entry.key().clone()))
            .collect();
        matches.sort_by_key(|(sequence, _)| *sequence);

        Ok(matches
            .into_iter()
            .map(|(_, id)| id)
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn delete(&self, execution_id: &str) -> Result<(), ExecutionError> {
        if let Some((_, record)) = self.executions.remove(execution_id) {
            if let Some(mut ids) = self.by_workflow.get_mut(&record.workflow_id) {
                ids.retain(|id| id != execution_id);
            }
        }
        self.node_executions.remove(execution_id);
        self.variable_snapshots.remove(execution_id);
        Ok(())
    }

    async fn save_node_execution(&self, node_execution: &NodeExecution) -> Result<(), ExecutionError> {
        let mut entries = self.node_executions.entry(node_execution.execution_id.clone()).or_default();
        if let Some(existing) = entries.iter_mut().find(|ne| ne.id == node_execution.id) {
            *existing = node_execution.clone();
        } else {
            entries.push(node_execution.clone());
        }
        Ok(())
    }

    async fn save_variable_snapshot(
        &self,
        execution_id: &str,
        snapshot: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ExecutionError> {
        self.variable_snapshots.insert(execution_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load_variable_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ExecutionError> {
        Ok(self.variable_snapshots.get(execution_id).map(|s| s.value().clone()))
    }
}
