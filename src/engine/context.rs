//! Thread-safe execution context: the variable store, its append-only
//! history, and the execution trace shared by every node executor running
//! under one [`crate::engine::execution::Execution`].

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::error::{ExecutionError, ExecutionErrorKind};

/// One write to a variable, kept forever in `ExecutionContext::history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSnapshot {
    /// When the write happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// The node-execution that performed the write, if any.
    pub node_execution_id: Option<String>,
    /// Variable name.
    pub name: String,
    /// Value before the write (`None` for the first write).
    pub old_value: Option<serde_json::Value>,
    /// Value after the write.
    pub new_value: serde_json::Value,
}

/// One entry in the execution trace: a node touched, and what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Node ID the entry concerns.
    pub node_id: String,
    /// Short event label (`"started"`, `"completed"`, ...).
    pub event: String,
    /// When the entry was recorded.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct Inner {
    variables: serde_json::Map<String, serde_json::Value>,
    history: Vec<VariableSnapshot>,
    trace: Vec<TraceEntry>,
    current_node: Option<String>,
}

/// Thread-safe variable store for one execution. All reads return deep
/// copies; deep copying goes through a JSON round trip, so only
/// JSON-representable values are supported and numbers become floating point
/// after a copy.
pub struct ExecutionContext {
    inner: RwLock<Inner>,
}

impl ExecutionContext {
    /// An empty context.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Seed the context with an initial variable mapping (the merged input +
    /// defaults). Does not go through `Set`, so no history entries are
    /// created for the initial values.
    pub async fn with_initial(variables: serde_json::Map<String, serde_json::Value>) -> Self {
        let ctx = Self::new();
        {
            let mut inner = ctx.inner.write().await;
            inner.variables = variables;
        }
        ctx
    }

    /// Reader-locked lookup; returns a deep copy and whether it was present.
    pub async fn get(&self, name: &str) -> (Option<serde_json::Value>, bool) {
        let inner = self.inner.read().await;
        match inner.variables.get(name) {
            Some(v) => (Some(deep_copy(v)), true),
            None => (None, false),
        }
    }

    /// Writer-locked update. Records a [`VariableSnapshot`] and appends it to
    /// the history.
    pub async fn set(&self, name: &str, value: serde_json::Value) {
        self.set_with_node(name, value, None).await
    }

    /// As [`Self::set`], but attributes the write to a node-execution ID so
    /// the audit trail can point back at the node that caused it.
    pub async fn set_with_node(
        &self,
        name: &str,
        value: serde_json::Value,
        node_execution_id: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        let old_value = inner.variables.get(name).map(deep_copy);
        inner.variables.insert(name.to_string(), deep_copy(&value));
        inner.history.push(VariableSnapshot {
            timestamp: chrono::Utc::now(),
            node_execution_id,
            name: name.to_string(),
            old_value,
            new_value: value,
        });
    }

    /// Writer-locked removal, used by the loop executor to release iteration
    /// variables on loop exit. Does not append to history: deletion is
    /// scope cleanup, not a semantic variable write.
    pub async fn delete(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.variables.remove(name);
    }

    /// Reader-locked deep copy of every variable.
    pub async fn create_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let inner = self.inner.read().await;
        deep_copy_map(&inner.variables)
    }

    /// Deep-copy this context's variables into `other`, overwriting whatever
    /// `other` held. Used for parallel-branch context isolation and for
    /// merging branch results back into the parent.
    pub async fn copy_variables_to(&self, other: &ExecutionContext) {
        let snapshot = self.create_snapshot().await;
        let mut other_inner = other.inner.write().await;
        other_inner.variables = snapshot;
    }

    /// Append a trace entry.
    pub async fn record_trace(&self, node_id: &str, event: &str) {
        let mut inner = self.inner.write().await;
        inner.trace.push(TraceEntry {
            node_id: node_id.to_string(),
            event: event.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Defensive copy of the execution trace.
    pub async fn get_execution_trace(&self) -> Vec<TraceEntry> {
        self.inner.read().await.trace.clone()
    }

    /// Defensive copy of the variable history.
    pub async fn get_variable_history(&self) -> Vec<VariableSnapshot> {
        self.inner.read().await.history.clone()
    }

    /// Mark the currently executing node, or clear it with `None`.
    pub async fn set_current_node(&self, node_id: Option<String>) {
        self.inner.write().await.current_node = node_id;
    }

    /// The currently executing node, if any.
    pub async fn get_current_node(&self) -> Option<String> {
        self.inner.read().await.current_node.clone()
    }

    /// Resolve a dotted-path `${...}` expression against this context.
    /// Delegates to [`resolve_placeholder`].
    pub async fn resolve(&self, path: &str) -> Result<serde_json::Value, ExecutionError> {
        let snapshot = self.create_snapshot().await;
        resolve_placeholder(path, &snapshot)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

fn deep_copy(value: &serde_json::Value) -> serde_json::Value {
    serde_json::from_value(serde_json::to_value(value).expect("Value serializes"))
        .expect("Value round-trips")
}

fn deep_copy_map(
    map: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.iter().map(|(k, v)| (k.clone(), deep_copy(v))).collect()
}

/// Resolve a dotted path (`varName` or `varName.field.sub`) against a
/// variable snapshot. The first segment must name a variable present in
/// `snapshot`; subsequent segments index into mapping (object) values only —
/// sequence indexing is intentionally unsupported (see design notes on
/// variable substitution).
pub fn resolve_placeholder(
    path: &str,
    snapshot: &serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Value, ExecutionError> {
    let mut segments = path.split('.');
    let first = segments.next().ok_or_else(|| {
        ExecutionError::new(
            ExecutionErrorKind::Execution,
            format!("empty variable expression: '{path}'"),
        )
    })?;

    let mut current = snapshot.get(first).cloned().ok_or_else(|| {
        ExecutionError::new(
            ExecutionErrorKind::Execution,
            format!("undefined variable: '{first}'"),
        )
    })?;

    for segment in segments {
        current = match current {
            serde_json::Value::Object(ref map) => map.get(segment).cloned().ok_or_else(|| {
                ExecutionError::new(
                    ExecutionErrorKind::Execution,
                    format!("missing field '{segment}' in path '{path}'"),
                )
            })?,
            _ => {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Execution,
                    format!("cannot index non-mapping value at '{segment}' in path '{path}'"),
                ))
            }
        };
    }

    Ok(current)
}

/// Stringify a resolved value the way `${...}` substitution does: strings
/// pass through verbatim, `null` becomes empty, everything else uses its
/// default JSON string form (quotes stripped for scalars).
pub fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let ctx = ExecutionContext::new();
        ctx.set("x", serde_json::json!(1)).await;
        let (value, present) = ctx.get("x").await;
        assert!(present);
        assert_eq!(value, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn set_appends_history_with_old_and_new() {
        let ctx = ExecutionContext::new();
        ctx.set("x", serde_json::json!(1)).await;
        ctx.set("x", serde_json::json!(2)).await;
        let history = ctx.get_variable_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_value, None);
        assert_eq!(history[1].old_value, Some(serde_json::json!(1)));
        assert_eq!(history[1].new_value, serde_json::json!(2));
    }

    #[tokio::test]
    async fn delete_removes_without_history_entry() {
        let ctx = ExecutionContext::new();
        ctx.set("x", serde_json::json!(1)).await;
        ctx.delete("x").await;
        let (value, present) = ctx.get("x").await;
        assert!(!present);
        assert_eq!(value, None);
        assert_eq!(ctx.get_variable_history().await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_is_a_deep_copy() {
        let ctx = ExecutionContext::new();
        ctx.set("obj", serde_json::json!({"a": 1})).await;
        let mut snapshot = ctx.create_snapshot().await;
        snapshot.insert("obj".into(), serde_json::json!({"a": 999}));
        let (value, _) = ctx.get("obj").await;
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn copy_variables_to_overwrites_target() {
        let src = ExecutionContext::new();
        src.set("x", serde_json::json!(1)).await;
        let dst = ExecutionContext::new();
        dst.set("y", serde_json::json!(2)).await;
        src.copy_variables_to(&dst).await;
        let (x, x_present) = dst.get("x").await;
        let (y, y_present) = dst.get("y").await;
        assert!(x_present && x == Some(serde_json::json!(1)));
        assert!(!y_present && y.is_none());
    }

    #[test]
    fn resolve_placeholder_walks_dotted_path() {
        let mut snapshot = serde_json::Map::new();
        snapshot.insert("user".into(), serde_json::json!({"name": "ada"}));
        let resolved = resolve_placeholder("user.name", &snapshot).unwrap();
        assert_eq!(resolved, serde_json::json!("ada"));
    }

    #[test]
    fn resolve_placeholder_errors_on_missing_variable() {
        let snapshot = serde_json::Map::new();
        assert!(resolve_placeholder("missing", &snapshot).is_err());
    }

    #[test]
    fn stringify_handles_null_and_string() {
        assert_eq!(stringify(&serde_json::Value::Null), "");
        assert_eq!(stringify(&serde_json::json!("hi")), "hi");
        assert_eq!(stringify(&serde_json::json!(42)), "42");
    }
}
