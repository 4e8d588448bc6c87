//! Audit-trail reconstruction: deriving a chronological event sequence
//! purely from an [`Execution`]'s persisted state, with JSON and compact
//! text export.

use serde::{Deserialize, Serialize};

use crate::engine::events::EventKind;
use crate::engine::execution::Execution;
use crate::graph::node::NodeStatus;

/// One reconstructed audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event happened. For synthetic retry events this is an
    /// approximation: see [`AuditTrail::reconstruct`].
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Node ID, if the event concerns one.
    pub node_id: Option<String>,
    /// Node type tag, if known.
    pub node_type: Option<String>,
    /// Node-execution ID, if known.
    pub node_execution_id: Option<String>,
    /// Human-readable summary.
    pub message: String,
    /// Structured detail payload.
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Duration, when the event represents a finished span.
    pub duration: Option<chrono::Duration>,
}

/// A reconstructed, exportable history of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrail {
    /// Execution ID this trail describes.
    pub execution_id: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Workflow version the execution ran against.
    pub workflow_version: String,
    /// Status of the execution at reconstruction time.
    pub status: String,
    /// When the execution started.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When the execution reached a terminal status.
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Wall-clock duration in nanoseconds, if the execution has finished.
    pub duration: Option<i64>,
    /// The execution's return value, if it completed.
    pub return_value: Option<serde_json::Value>,
    /// Reconstructed events, in chronological order.
    pub events: Vec<AuditEvent>,
    /// Count of nodes that ran (any terminal status).
    pub node_count: usize,
    /// Count of node-level failures.
    pub error_count: usize,
    /// Count of variable writes.
    pub variable_change_count: usize,
    /// Count of synthetic retry events inferred from `retry_count` fields.
    pub retry_count: usize,
}

impl AuditTrail {
    /// Rebuild a trail from an execution's current state.
    ///
    /// Event ordering: execution-started, then for each node execution in
    /// dispatch order one synthetic `NodeRetried` event per consumed retry
    /// (placed strictly before `started_at`, oldest attempt furthest back —
    /// these timestamps are approximate, since individual retry attempt
    /// times are not persisted), then its started/terminal events, then
    /// variable-change events in their recorded order, then the execution's
    /// own terminal event last.
    pub fn reconstruct(execution: &Execution, variable_history: &[crate::engine::context::VariableSnapshot]) -> Self {
        let mut events = Vec::new();

        if let Some(started_at) = execution.started_at {
            events.push(AuditEvent {
                timestamp: started_at,
                kind: EventKind::ExecutionStarted,
                node_id: None,
                node_type: None,
                node_execution_id: None,
                message: format!("execution {} started", execution.id),
                details: serde_json::Map::new(),
                duration: None,
            });
        }

        let mut error_count = 0;
        let mut retry_total = 0;

        for ne in &execution.node_executions {
            if let Some(started_at) = ne.started_at {
                events.push(AuditEvent {
                    timestamp: started_at,
                    kind: EventKind::NodeStarted,
                    node_id: Some(ne.node_id.clone()),
                    node_type: Some(ne.node_type.clone()),
                    node_execution_id: Some(ne.id.clone()),
                    message: format!("node '{}' started", ne.node_id),
                    details: serde_json::Map::new(),
                    duration: None,
                });
            }

            if ne.retry_count > 0 {
                retry_total += ne.retry_count as usize;
                if let Some(start) = ne.started_at {
                    let retry_step = chrono::Duration::milliseconds(1);
                    for attempt in 1..=ne.retry_count {
                        let approx_ts = start - retry_step * ((ne.retry_count - attempt + 1) as i32);
                        events.push(AuditEvent {
                            timestamp: approx_ts,
                            kind: EventKind::NodeRetried,
                            node_id: Some(ne.node_id.clone()),
                            node_type: Some(ne.node_type.clone()),
                            node_execution_id: Some(ne.id.clone()),
                            message: format!("node '{}' retry {attempt} (timestamp approximate)", ne.node_id),
                            details: serde_json::Map::new(),
                            duration: None,
                        });
                    }
                }
            }

            match ne.status {
                NodeStatus::Completed => {
                    events.push(AuditEvent {
                        timestamp: ne.completed_at.unwrap_or(ne.started_at.unwrap_or_default()),
                        kind: EventKind::NodeCompleted,
                        node_id: Some(ne.node_id.clone()),
                        node_type: Some(ne.node_type.clone()),
                        node_execution_id: Some(ne.id.clone()),
                        message: format!("node '{}' completed", ne.node_id),
                        details: ne.outputs.clone(),
                        duration: Some(ne.duration()),
                    });
                }
                NodeStatus::Failed => {
                    error_count += 1;
                    let mut details = serde_json::Map::new();
                    if let Some(error) = &ne.error {
                        details.insert("message".into(), serde_json::json!(error.message));
                        details.insert("kind".into(), serde_json::json!(error.kind.to_string()));
                    }
                    events.push(AuditEvent {
                        timestamp: ne.completed_at.unwrap_or(ne.started_at.unwrap_or_default()),
                        kind: EventKind::NodeFailed,
                        node_id: Some(ne.node_id.clone()),
                        node_type: Some(ne.node_type.clone()),
                        node_execution_id: Some(ne.id.clone()),
                        message: format!("node '{}' failed", ne.node_id),
                        details,
                        duration: Some(ne.duration()),
                    });
                }
                NodeStatus::Skipped => {
                    events.push(AuditEvent {
                        timestamp: ne.completed_at.unwrap_or(ne.started_at.unwrap_or_default()),
                        kind: EventKind::NodeSkipped,
                        node_id: Some(ne.node_id.clone()),
                        node_type: Some(ne.node_type.clone()),
                        node_execution_id: Some(ne.id.clone()),
                        message: format!("node '{}' skipped", ne.node_id),
                        details: serde_json::Map::new(),
                        duration: None,
                    });
                }
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }

        let variable_change_count = variable_history.len();
        for snapshot in variable_history {
            let mut details = serde_json::Map::new();
            details.insert("old_value".into(), snapshot.old_value.clone().unwrap_or(serde_json::Value::Null));
            details.insert("new_value".into(), snapshot.new_value.clone());
            events.push(AuditEvent {
                timestamp: snapshot.timestamp,
                kind: EventKind::VariableChanged,
                node_id: None,
                node_type: None,
                node_execution_id: snapshot.node_execution_id.clone(),
                message: format!("variable '{}' changed", snapshot.name),
                details,
                duration: None,
            });
        }

        if let Some(completed_at) = execution.completed_at {
            let (kind, message) = match execution.status {
                crate::engine::execution::ExecutionStatus::Completed => {
                    (EventKind::ExecutionCompleted, "execution completed".to_string())
                }
                crate::engine::execution::ExecutionStatus::Failed => {
                    (EventKind::ExecutionFailed, "execution failed".to_string())
                }
                crate::engine::execution::ExecutionStatus::Cancelled => {
                    (EventKind::ExecutionCancelled, "execution cancelled".to_string())
                }
                _ => (EventKind::ExecutionCompleted, "execution finished".to_string()),
            };
            events.push(AuditEvent {
                timestamp: completed_at,
                kind,
                node_id: None,
                node_type: None,
                node_execution_id: None,
                message,
                details: serde_json::Map::new(),
                duration: Some(execution.duration()),
            });
        }

        events.sort_by_key(|e| e.timestamp);

        Self {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            workflow_version: execution.workflow_version.clone(),
            status: format!("{:?}", execution.status),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration: execution
                .completed_at
                .and_then(|_| execution.duration().num_nanoseconds()),
            return_value: execution.return_value.clone(),
            node_count: execution.node_executions.len(),
            error_count,
            variable_change_count,
            retry_count: retry_total,
            events,
        }
    }

    /// Events of a specific kind, in order.
    pub fn get_events_by_type(&self, kind: EventKind) -> Vec<&AuditEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    /// Events concerning a specific node.
    pub fn get_events_for_node(&self, node_id: &str) -> Vec<&AuditEvent> {
        self.events
            .iter()
            .filter(|e| e.node_id.as_deref() == Some(node_id))
            .collect()
    }

    /// All node-failure events.
    pub fn get_error_events(&self) -> Vec<&AuditEvent> {
        self.get_events_by_type(EventKind::NodeFailed)
    }

    /// All variable-change events.
    pub fn get_variable_changes(&self) -> Vec<&AuditEvent> {
        self.get_events_by_type(EventKind::VariableChanged)
    }

    /// Events within `[start, end]`, inclusive, restricted to the kinds in
    /// `kinds` when non-empty.
    pub fn filter(
        &self,
        kinds: &[EventKind],
        node_id: Option<&str>,
        start: Option<chrono::DateTime<chrono::Utc>>,
        end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Vec<&AuditEvent> {
        self.events
            .iter()
            .filter(|e| kinds.is_empty() || kinds.contains(&e.kind))
            .filter(|e| node_id.map(|id| e.node_id.as_deref() == Some(id)).unwrap_or(true))
            .filter(|e| start.map(|s| e.timestamp >= s).unwrap_or(true))
            .filter(|e| end.map(|s| e.timestamp <= s).unwrap_or(true))
            .collect()
    }

    /// Indented JSON export (the canonical exchange format).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Compact, deterministic text report: one line per event, each
    /// prefixed with a status glyph and the offset from the execution's
    /// start.
    pub fn to_text_report(&self) -> String {
        let origin = self.events.first().map(|e| e.timestamp);
        let mut out = String::new();
        out.push_str(&format!(
            "execution {} ({}) — {} nodes, {} errors, {} variable changes, {} retries\n",
            self.execution_id, self.status, self.node_count, self.error_count, self.variable_change_count, self.retry_count
        ));
        for event in &self.events {
            let glyph = match event.kind {
                EventKind::NodeFailed | EventKind::ExecutionFailed => "x",
                EventKind::NodeCompleted | EventKind::ExecutionCompleted => "+",
                EventKind::NodeSkipped => "-",
                EventKind::ExecutionCancelled => "!",
                _ => ".",
            };
            let offset = origin
                .map(|o| (event.timestamp - o).num_milliseconds())
                .unwrap_or(0);
            out.push_str(&format!("[{glyph}] +{offset}ms {}\n", event.message));
        }
        out
    }
}
