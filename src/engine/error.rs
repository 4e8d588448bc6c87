//! The execution error model: a terminal `ExecutionError`, its enhanced
//! form carrying full diagnostic context, and the classification rules used
//! by both the audit trail and the retry executor's allow/deny matching.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::node::NodeStatus;

/// The error taxonomy. Not exhaustive of every possible failure mode, but
/// every surfaced error is classified into exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    /// Input or workflow-shape validation failed.
    Validation,
    /// A tool-server connection could not be established or was lost.
    Connection,
    /// A node failed during ordinary execution.
    Execution,
    /// A transform or condition failed to interpret its data.
    Data,
    /// An operation exceeded its deadline.
    Timeout,
}

impl ExecutionErrorKind {
    /// Parse the lowercase names used by retry allow/deny pattern lists.
    pub fn from_pattern_name(name: &str) -> Option<Self> {
        match name {
            "validation" => Some(Self::Validation),
            "connection" => Some(Self::Connection),
            "execution" => Some(Self::Execution),
            "data" => Some(Self::Data),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Connection => "connection",
            Self::Execution => "execution",
            Self::Data => "data",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Derived severity, used for the enhanced classification view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Needs immediate attention; the workflow cannot proceed meaningfully.
    Critical,
    /// Likely to need a workflow author's attention.
    High,
    /// Transient; likely resolves with a retry.
    Medium,
    /// Informational.
    Low,
}

/// A terminal error surfaced by a node executor or the scheduler.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    /// Classified error kind.
    pub kind: ExecutionErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Node ID active when the error occurred, if known.
    pub node_id: Option<String>,
    /// Captured stack trace, for diagnostics only.
    pub stack_trace: String,
    /// Structured, kind-specific context (e.g. `server_id`, `tool_name`).
    pub context: HashMap<String, serde_json::Value>,
    /// Whether a retry executor should consider this retryable.
    pub recoverable: bool,
    /// When the error was constructed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExecutionError {
    /// Construct a bare error with no node/context, not recoverable by
    /// default. Use the `with_*` builders or the kind-specific factories
    /// below to add detail.
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            stack_trace: capture_stack_trace(),
            context: HashMap::new(),
            recoverable: false,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach the originating node ID.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Mark the error recoverable (eligible for retry wrappers).
    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }

    /// Merge additional context entries.
    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context.extend(context);
        self
    }

    /// A tool-invocation failure. Classifies as `Connection` (recoverable)
    /// when the message suggests a transport problem, else `Execution`
    /// (non-recoverable).
    pub fn tool_error(
        server_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let looks_transient = {
            let lower = message.to_lowercase();
            lower.contains("timeout") || lower.contains("connection")
        };
        let mut context = HashMap::new();
        context.insert("server_id".into(), serde_json::json!(server_id));
        context.insert("tool_name".into(), serde_json::json!(tool_name));
        context.insert("parameters".into(), params.clone());

        let mut err = if looks_transient {
            Self::new(ExecutionErrorKind::Connection, message).recoverable()
        } else {
            Self::new(ExecutionErrorKind::Execution, message)
        };
        err.context.extend(context);
        err
    }

    /// A transform/condition failure: always `Data`, non-recoverable.
    pub fn data_error(expression: &str, input_value: &serde_json::Value, message: impl Into<String>) -> Self {
        let mut context = HashMap::new();
        context.insert("expression".into(), serde_json::json!(expression));
        context.insert("input_value".into(), input_value.clone());
        Self::new(ExecutionErrorKind::Data, message).with_context(context)
    }

    /// A workflow or input validation failure: always non-recoverable.
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Validation, message)
    }

    /// A tool-server connection failure: recoverable by default (the
    /// scheduler treats connection errors as transient unless retries are
    /// exhausted upstream).
    pub fn connection_error(server_id: &str, message: impl Into<String>) -> Self {
        let mut context = HashMap::new();
        context.insert("server_id".into(), serde_json::json!(server_id));
        Self::new(ExecutionErrorKind::Connection, message)
            .recoverable()
            .with_context(context)
    }

    /// A deadline was exceeded while `operation` was in flight.
    pub fn timeout_error(operation: &str, timeout: std::time::Duration, message: impl Into<String>) -> Self {
        let mut context = HashMap::new();
        context.insert("operation".into(), serde_json::json!(operation));
        context.insert("timeout".into(), serde_json::json!(timeout.as_millis()));
        Self::new(ExecutionErrorKind::Timeout, message).with_context(context)
    }

    /// Derive an [`ErrorClassification`] per the rules in §4.10.
    pub fn classify(&self) -> ErrorClassification {
        let (severity, hint) = match self.kind {
            ExecutionErrorKind::Validation => (Severity::High, "fix validation errors"),
            ExecutionErrorKind::Connection => (Severity::Medium, "check server, retry"),
            ExecutionErrorKind::Timeout => (Severity::Medium, "raise timeout or optimize"),
            ExecutionErrorKind::Data => (Severity::High, "verify transformation and inputs"),
            ExecutionErrorKind::Execution if self.recoverable => {
                (Severity::Medium, "retry with same parameters")
            }
            ExecutionErrorKind::Execution => (Severity::Critical, "review and adjust workflow"),
        };
        ErrorClassification {
            kind: self.kind,
            severity,
            recoverable: self.recoverable,
            retry_hint: hint.to_string(),
        }
    }
}

fn capture_stack_trace() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

/// The derived view of an error's severity and retry-worthiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    /// Classified kind.
    pub kind: ExecutionErrorKind,
    /// Derived severity.
    pub severity: Severity,
    /// Whether the error is recoverable.
    pub recoverable: bool,
    /// A short, human-readable suggestion.
    pub retry_hint: String,
}

/// One frame of a parsed stack trace, for the enhanced diagnostic view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    /// Function name, if recoverable from the trace text.
    pub function: String,
    /// Source file.
    pub file: String,
    /// Line number.
    pub line: u32,
    /// Crate/package the frame belongs to.
    pub package: String,
}

/// One step of the node-execution chain attached to an `EnhancedError`:
/// just enough to reconstruct "what ran before this failed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLink {
    /// Node ID.
    pub node_id: String,
    /// Node type tag.
    pub node_type: String,
    /// Terminal status this node reached.
    pub status: NodeStatus,
}

/// An `ExecutionError` augmented with everything needed to diagnose it
/// without re-running the workflow: an MCP tool-server log snapshot, the
/// node-execution chain leading up to the failure, a variable snapshot, a
/// parsed stack trace, and the derived classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    /// The underlying terminal error.
    pub error: ExecutionError,
    /// Opaque log records captured from tool servers, if any were involved.
    pub mcp_log_snapshot: Vec<serde_json::Value>,
    /// Nodes that ran before (and including) the failing one.
    pub node_execution_chain: Vec<ChainLink>,
    /// Variable state at the time of failure.
    pub variable_snapshot: serde_json::Map<String, serde_json::Value>,
    /// Parsed frames of `error.stack_trace`, best-effort.
    pub parsed_stack: Vec<StackFrame>,
    /// Derived classification.
    pub classification: ErrorClassification,
}

impl EnhancedError {
    /// Build the enhanced view around a terminal error.
    pub fn new(
        error: ExecutionError,
        mcp_log_snapshot: Vec<serde_json::Value>,
        node_execution_chain: Vec<ChainLink>,
        variable_snapshot: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let classification = error.classify();
        let parsed_stack = parse_stack_trace(&error.stack_trace);
        Self {
            error,
            mcp_log_snapshot,
            node_execution_chain,
            variable_snapshot,
            parsed_stack,
            classification,
        }
    }
}

/// Best-effort parse of a captured Rust backtrace into `{function, file,
/// line, package}` frames. Frames that don't match the expected
/// `N: path::to::fn` / `at file:line` pairing are skipped; this is a
/// diagnostic aid, never used for control flow.
fn parse_stack_trace(raw: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut pending_function: Option<String> = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.split_once(": ") {
            if rest.0.chars().all(|c| c.is_ascii_digit()) {
                pending_function = Some(rest.1.to_string());
                continue;
            }
        }
        if let Some(rest) = trimmed.strip_prefix("at ") {
            if let Some(function) = pending_function.take() {
                let (file, line_no) = rest
                    .rsplit_once(':')
                    .map(|(f, l)| (f.to_string(), l.parse().unwrap_or(0)))
                    .unwrap_or((rest.to_string(), 0));
                let package = function
                    .split("::")
                    .next()
                    .unwrap_or_default()
                    .to_string();
                frames.push(StackFrame {
                    function,
                    file,
                    line: line_no,
                    package,
                });
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_classifies_timeout_message_as_connection_recoverable() {
        let err = ExecutionError::tool_error("srv", "fetch", &serde_json::json!({}), "connection timeout");
        assert_eq!(err.kind, ExecutionErrorKind::Connection);
        assert!(err.recoverable);
    }

    #[test]
    fn tool_error_classifies_other_message_as_execution_non_recoverable() {
        let err = ExecutionError::tool_error("srv", "fetch", &serde_json::json!({}), "bad argument");
        assert_eq!(err.kind, ExecutionErrorKind::Execution);
        assert!(!err.recoverable);
    }

    #[test]
    fn classification_severity_follows_kind_and_recoverability() {
        let validation = ExecutionError::validation_error("bad input");
        assert_eq!(validation.classify().severity, Severity::High);

        let connection = ExecutionError::connection_error("srv", "down");
        assert_eq!(connection.classify().severity, Severity::Medium);

        let exec_recoverable = ExecutionError::new(ExecutionErrorKind::Execution, "oops").recoverable();
        assert_eq!(exec_recoverable.classify().severity, Severity::Medium);

        let exec_fatal = ExecutionError::new(ExecutionErrorKind::Execution, "oops");
        assert_eq!(exec_fatal.classify().severity, Severity::Critical);
    }

    #[test]
    fn from_pattern_name_parses_known_kinds() {
        assert_eq!(
            ExecutionErrorKind::from_pattern_name("connection"),
            Some(ExecutionErrorKind::Connection)
        );
        assert_eq!(ExecutionErrorKind::from_pattern_name("nonsense"), None);
    }
}
