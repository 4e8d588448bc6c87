//! Collaborator traits the engine depends on but does not implement: the
//! tool-server wire protocol, expression/JSONPath evaluation, and execution
//! persistence. Each ships a minimal in-memory implementation for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::error::ExecutionError;
use crate::engine::execution::{Execution, ExecutionStatus, NodeExecution};

/// One connected tool server. Connection lifecycle and the wire protocol are
/// out of scope for this crate; callers provide an implementation.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Open the connection, if not already open.
    async fn connect(&self) -> Result<(), ExecutionError>;
    /// List tools this server currently exposes.
    async fn discover_tools(&self) -> Result<Vec<String>, ExecutionError>;
    /// Invoke `tool` with `params`, returning its result value.
    async fn invoke(&self, tool: &str, params: &Value) -> Result<Value, ExecutionError>;
    /// Close the connection.
    async fn disconnect(&self) -> Result<(), ExecutionError>;
}

/// Looks up a [`ToolServer`] by the ID a `Tool` node references.
#[async_trait]
pub trait ToolServerRegistry: Send + Sync {
    /// Fetch a registered server, or an error if `server_id` is unknown.
    async fn get(&self, server_id: &str) -> Result<std::sync::Arc<dyn ToolServer>, ExecutionError>;
}

/// Evaluates the expression language used by `Transform` and `Condition`
/// nodes. Syntax and semantics are an external concern; the engine only
/// needs these two operations.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// Apply `expression` (a JSONPath query or transform expression) to
    /// `data`, returning the transformed value.
    async fn transform(&self, expression: &str, data: &Value) -> Result<Value, ExecutionError>;
    /// Evaluate `expression` as a boolean against `env`.
    async fn evaluate(&self, expression: &str, env: &Value) -> Result<bool, ExecutionError>;
}

/// Filter and pagination controls for [`ExecutionRepository::list`]. The
/// default (`Default::default()`) lists every execution, unpaginated.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict to executions for this workflow ID.
    pub workflow_id: Option<String>,
    /// Restrict to executions with this status.
    pub status: Option<ExecutionStatus>,
    /// Skip this many matching executions before collecting the page.
    pub offset: usize,
    /// Cap the page at this many executions; `None` means unbounded.
    pub limit: Option<usize>,
}

/// Persists executions and their node-level records. File formats and
/// storage backends are out of scope; this is the seam a caller wires a
/// real backend into.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Persist (insert or overwrite) `execution`'s top-level record.
    async fn save(&self, execution: &Execution) -> Result<(), ExecutionError>;
    /// Load an execution by ID.
    async fn load(&self, execution_id: &str) -> Result<Option<Execution>, ExecutionError>;
    /// List every execution for a given workflow ID.
    async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<String>, ExecutionError>;
    /// List every execution with a given status.
    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<String>, ExecutionError>;
    /// List execution IDs matching `options`, oldest-saved first.
    async fn list(&self, options: &ListOptions) -> Result<Vec<String>, ExecutionError>;
    /// Remove a persisted execution.
    async fn delete(&self, execution_id: &str) -> Result<(), ExecutionError>;
    /// Persist one node-execution record.
    async fn save_node_execution(&self, node_execution: &NodeExecution) -> Result<(), ExecutionError>;
    /// Persist a point-in-time snapshot of an execution's full variable set,
    /// for checkpoint/resume use distinct from the per-write audit history
    /// kept on [`crate::engine::context::ExecutionContext`].
    async fn save_variable_snapshot(
        &self,
        execution_id: &str,
        snapshot: &serde_json::Map<String, Value>,
    ) -> Result<(), ExecutionError>;
    /// Load the most recently saved variable snapshot for an execution, if
    /// one was ever saved.
    async fn load_variable_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<serde_json::Map<String, Value>>, ExecutionError>;
}

/// A deterministic, self-describing tool server for tests: echoes its
/// parameters back under `"echo"`.
pub struct EchoToolServer {
    tools: Vec<String>,
}

impl EchoToolServer {
    /// A server that claims to expose `tools`.
    pub fn new(tools: Vec<String>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl ToolServer for EchoToolServer {
    async fn connect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn discover_tools(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(self.tools.clone())
    }

    async fn invoke(&self, tool: &str, params: &Value) -> Result<Value, ExecutionError> {
        if !self.tools.iter().any(|t| t == tool) {
            return Err(ExecutionError::tool_error("echo", tool, params, format!("unknown tool '{tool}'")));
        }
        Ok(serde_json::json!({ "echo": params }))
    }

    async fn disconnect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// An in-memory registry mapping server IDs to [`ToolServer`]s, for tests.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    servers: HashMap<String, std::sync::Arc<dyn ToolServer>>,
}

impl InMemoryToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under `server_id`.
    pub fn register(&mut self, server_id: impl Into<String>, server: std::sync::Arc<dyn ToolServer>) {
        self.servers.insert(server_id.into(), server);
    }
}

#[async_trait]
impl ToolServerRegistry for InMemoryToolRegistry {
    async fn get(&self, server_id: &str) -> Result<std::sync::Arc<dyn ToolServer>, ExecutionError> {
        self.servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| ExecutionError::connection_error(server_id, format!("no such tool server '{server_id}'")))
    }
}

/// An evaluator that treats `expression` as a dotted variable path for
/// `transform` (delegating to [`crate::engine::context::resolve_placeholder`])
/// and as a literal `"true"`/`"false"` for `evaluate`. Useful for tests that
/// don't need a real expression language.
pub struct IdentityEvaluator;

#[async_trait]
impl ExpressionEvaluator for IdentityEvaluator {
    async fn transform(&self, expression: &str, data: &Value) -> Result<Value, ExecutionError> {
        let map = match data {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        crate::engine::context::resolve_placeholder(expression, &map)
    }

    async fn evaluate(&self, expression: &str, _env: &Value) -> Result<bool, ExecutionError> {
        match expression.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(ExecutionError::data_error(expression, _env, format!("cannot evaluate '{other}'"))),
        }
    }
}
