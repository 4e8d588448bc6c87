//! Per-kind node execution: Start, End, Tool, Transform, Condition, and
//! Passthrough. Parallel and Loop nodes are dispatched by the scheduler to
//! [`crate::engine::parallel_executor`] and [`crate::engine::loop_executor`]
//! instead, since they recurse back into this module for their bodies.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::engine::context::{resolve_placeholder, stringify, ExecutionContext};
use crate::engine::error::ExecutionError;
use crate::engine::traits::{ExpressionEvaluator, ToolServerRegistry};
use crate::graph::node::NodeKind;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").unwrap())
}

/// Substitute every `${dotted.path}` occurrence in `template` with its
/// resolved, stringified value. A lone `${path}` spanning the whole string
/// returns the resolved value unstringified (so non-string types survive);
/// anything else is string-substituted in place.
pub fn substitute(template: &str, snapshot: &serde_json::Map<String, Value>) -> Result<Value, ExecutionError> {
    if let Some(caps) = placeholder_regex().captures(template) {
        if caps.get(0).map(|m| m.as_str()) == Some(template) {
            let path = &caps[1];
            return resolve_placeholder(path, snapshot);
        }
    }
    let mut result = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in placeholder_regex().captures_iter(template) {
        let whole = caps.get(0).unwrap();
        result.push_str(&template[last_end..whole.start()]);
        let path = &caps[1];
        let resolved = resolve_placeholder(path, snapshot)?;
        result.push_str(&stringify(&resolved));
        last_end = whole.end();
    }
    result.push_str(&template[last_end..]);
    Ok(Value::String(result))
}

/// Substitute `${...}` placeholders recursively through an arbitrary JSON
/// value (used for `Tool` node parameters).
pub fn substitute_value(value: &Value, snapshot: &serde_json::Map<String, Value>) -> Result<Value, ExecutionError> {
    match value {
        Value::String(s) => substitute(s, snapshot),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, snapshot)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, snapshot)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Whether `expression` looks like a JSONPath query rather than the
/// evaluator's own expression language: a leading `$.`/`$[`, a bare `$`, or
/// the presence of `..`, `[?(`, or `[*]`.
pub fn looks_like_jsonpath(expression: &str) -> bool {
    let trimmed = expression.trim();
    trimmed == "$"
        || trimmed.starts_with("$.")
        || trimmed.starts_with("$[")
        || trimmed.contains("..")
        || trimmed.contains("[?(")
        || trimmed.contains("[*]")
}

/// Executes the `Start` node: no-op, present only so the scheduler has a
/// uniform dispatch entry point.
pub async fn execute_start() -> Result<serde_json::Map<String, Value>, ExecutionError> {
    Ok(serde_json::Map::new())
}

/// Executes the `End` node: resolves `return_expr` against the context, if
/// present, and returns it under `"return_value"`.
pub async fn execute_end(
    return_expr: Option<&str>,
    context: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>, ExecutionError> {
    let mut outputs = serde_json::Map::new();
    if let Some(expr) = return_expr {
        let snapshot = context.create_snapshot().await;
        let value = substitute(expr, &snapshot)?;
        outputs.insert("return_value".to_string(), value);
    }
    Ok(outputs)
}

/// Executes a `Tool` node: substitutes `${...}` placeholders through every
/// parameter, invokes the named tool, and writes the result to
/// `output_var`.
pub async fn execute_tool(
    server_id: &str,
    tool_name: &str,
    params: &serde_json::Map<String, Value>,
    output_var: &str,
    context: &ExecutionContext,
    registry: &dyn ToolServerRegistry,
) -> Result<serde_json::Map<String, Value>, ExecutionError> {
    let snapshot = context.create_snapshot().await;
    let resolved_params = substitute_value(&Value::Object(params.clone()), &snapshot)?;

    let server = registry.get(server_id).await?;
    let result = server.invoke(tool_name, &resolved_params).await?;

    context.set(output_var, result.clone()).await;

    let mut outputs = serde_json::Map::new();
    outputs.insert(output_var.to_string(), result);
    Ok(outputs)
}

/// Executes a `Transform` node: reads `input_var`, applies `expression`
/// (JSONPath or evaluator expression, per [`looks_like_jsonpath`]), writes
/// the result to `output_var`.
///
/// JSONPath expressions query the input variable's value directly; general
/// expressions evaluate against the full variable snapshot as their
/// environment, so they can reference variables beyond `input_var`.
pub async fn execute_transform(
    input_var: &str,
    expression: &str,
    output_var: &str,
    context: &ExecutionContext,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<serde_json::Map<String, Value>, ExecutionError> {
    let (input_value, present) = context.get(input_var).await;
    let input_value = input_value.unwrap_or(Value::Null);
    if !present {
        return Err(ExecutionError::data_error(
            expression,
            &input_value,
            format!("input variable '{input_var}' is undefined"),
        )
        .with_node(output_var));
    }

    let result = if looks_like_jsonpath(expression) {
        evaluator.transform(expression, &input_value).await?
    } else {
        let snapshot = context.create_snapshot().await;
        evaluator.transform(expression, &Value::Object(snapshot)).await?
    };
    context.set(output_var, result.clone()).await;

    let mut outputs = serde_json::Map::new();
    outputs.insert(output_var.to_string(), result);
    Ok(outputs)
}

/// Rewrites a leading `$.varName` JSONPath-style variable reference to bare
/// `varName` when `varName` is present in `snapshot`, leaving everything
/// else (including the rest of the expression) untouched.
fn rewrite_dollar_var_refs(expression: &str, snapshot: &serde_json::Map<String, Value>) -> String {
    static DOLLAR_VAR: OnceLock<Regex> = OnceLock::new();
    let re = DOLLAR_VAR.get_or_init(|| Regex::new(r"\$\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    re.replace_all(expression, |caps: &regex::Captures| {
        let name = &caps[1];
        if snapshot.contains_key(name) {
            name.to_string()
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Executes a `Condition` node: rewrites any `$.varName` reference to a
/// present snapshot variable down to bare `varName`, then evaluates
/// `expression` against the current variable snapshot, returning the
/// boolean the scheduler uses to pick the matching outgoing edge label.
pub async fn execute_condition(
    expression: &str,
    context: &ExecutionContext,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<bool, ExecutionError> {
    let snapshot = context.create_snapshot().await;
    let rewritten = rewrite_dollar_var_refs(expression, &snapshot);
    evaluator.evaluate(&rewritten, &Value::Object(snapshot)).await
}

/// Executes a `Passthrough` node: copies `input_var` to `output_var`
/// unchanged. With both `None`, it's a pure no-op.
pub async fn execute_passthrough(
    input_var: Option<&str>,
    output_var: Option<&str>,
    context: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>, ExecutionError> {
    let mut outputs = serde_json::Map::new();
    if let (Some(input), Some(output)) = (input_var, output_var) {
        let (value, _) = context.get(input).await;
        let value = value.unwrap_or(Value::Null);
        context.set(output, value.clone()).await;
        outputs.insert(output.to_string(), value);
    }
    Ok(outputs)
}

/// The node-type tag to use for a `NodeExecution` record, matching
/// [`crate::graph::node::Node::type_tag`].
pub fn type_tag_for(kind: &NodeKind) -> &'static str {
    match kind {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::traits::{EchoToolServer, IdentityEvaluator, InMemoryToolRegistry};

    fn snapshot_with(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn substitute_replaces_whole_string_placeholder_preserving_type() {
        let snapshot = snapshot_with(&[("x", serde_json::json!(42))]);
        let result = substitute("${x}", &snapshot).unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn substitute_stringifies_embedded_placeholder() {
        let snapshot = snapshot_with(&[("name", serde_json::json!("ada"))]);
        let result = substitute("hello ${name}!", &snapshot).unwrap();
        assert_eq!(result, serde_json::json!("hello ada!"));
    }

    #[test]
    fn looks_like_jsonpath_detects_dollar_prefix_and_wildcards() {
        assert!(looks_like_jsonpath("$.a.b"));
        assert!(looks_like_jsonpath("$[0]"));
        assert!(looks_like_jsonpath("$..deep"));
        assert!(looks_like_jsonpath("a[*]"));
        assert!(!looks_like_jsonpath("a.b.c"));
    }

    #[tokio::test]
    async fn execute_end_resolves_return_expr() {
        let ctx = ExecutionContext::new();
        ctx.set("x", serde_json::json!(7)).await;
        let outputs = execute_end(Some("${x}"), &ctx).await.unwrap();
        assert_eq!(outputs["return_value"], serde_json::json!(7));
    }

    #[tokio::test]
    async fn execute_end_with_no_expr_returns_empty() {
        let ctx = ExecutionContext::new();
        let outputs = execute_end(None, &ctx).await.unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn execute_tool_substitutes_params_and_stores_output() {
        let ctx = ExecutionContext::new();
        ctx.set("city", serde_json::json!("paris")).await;
        let mut registry = InMemoryToolRegistry::new();
        registry.register("srv", std::sync::Arc::new(EchoToolServer::new(vec!["lookup".into()])));
        let mut params = serde_json::Map::new();
        params.insert("where".to_string(), serde_json::json!("${city}"));

        let outputs = execute_tool("srv", "lookup", &params, "result", &ctx, &registry)
            .await
            .unwrap();
        assert_eq!(outputs["result"]["echo"]["where"], serde_json::json!("paris"));
        let (stored, present) = ctx.get("result").await;
        assert!(present);
        assert_eq!(stored.unwrap()["echo"]["where"], serde_json::json!("paris"));
    }

    #[tokio::test]
    async fn execute_transform_errors_on_undefined_input() {
        let ctx = ExecutionContext::new();
        let evaluator = IdentityEvaluator;
        let result = execute_transform("missing", "missing.field", "out", &ctx, &evaluator).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_transform_writes_output_variable() {
        let ctx = ExecutionContext::new();
        ctx.set("input", serde_json::json!({"user": {"name": "ada"}})).await;
        let evaluator = IdentityEvaluator;
        // A general (non-JSONPath) expression evaluates against the full
        // variable snapshot, not just `input_var`'s value.
        let outputs = execute_transform("input", "input.user.name", "name", &ctx, &evaluator)
            .await
            .unwrap();
        assert_eq!(outputs["name"], serde_json::json!("ada"));
    }

    /// Records the `data` argument it was last called with, so tests can
    /// assert what `execute_transform` passes through without needing a real
    /// JSONPath/expression implementation.
    struct RecordingEvaluator {
        last_data: tokio::sync::Mutex<Option<Value>>,
    }

    impl RecordingEvaluator {
        fn new() -> Self {
            Self {
                last_data: tokio::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl ExpressionEvaluator for RecordingEvaluator {
        async fn transform(&self, _expression: &str, data: &Value) -> Result<Value, ExecutionError> {
            *self.last_data.lock().await = Some(data.clone());
            Ok(Value::Null)
        }

        async fn evaluate(&self, _expression: &str, _env: &Value) -> Result<bool, ExecutionError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn execute_transform_jsonpath_passes_only_the_input_value() {
        let ctx = ExecutionContext::new();
        ctx.set("input", serde_json::json!({"user": {"name": "ada"}})).await;
        ctx.set("other", serde_json::json!("unrelated")).await;
        let evaluator = RecordingEvaluator::new();
        execute_transform("input", "$.user.name", "name", &ctx, &evaluator)
            .await
            .unwrap();
        let seen = evaluator.last_data.lock().await.clone().unwrap();
        assert_eq!(seen, serde_json::json!({"user": {"name": "ada"}}));
    }

    #[tokio::test]
    async fn execute_transform_general_expression_passes_the_full_snapshot() {
        let ctx = ExecutionContext::new();
        ctx.set("input", serde_json::json!({"user": {"name": "ada"}})).await;
        ctx.set("other", serde_json::json!("unrelated")).await;
        let evaluator = RecordingEvaluator::new();
        execute_transform("input", "some expression", "name", &ctx, &evaluator)
            .await
            .unwrap();
        let seen = evaluator.last_data.lock().await.clone().unwrap();
        assert_eq!(seen["other"], serde_json::json!("unrelated"));
        assert_eq!(seen["input"], serde_json::json!({"user": {"name": "ada"}}));
    }

    #[tokio::test]
    async fn execute_condition_evaluates_boolean() {
        let ctx = ExecutionContext::new();
        let evaluator = IdentityEvaluator;
        assert!(execute_condition("true", &ctx, &evaluator).await.unwrap());
        assert!(!execute_condition("false", &ctx, &evaluator).await.unwrap());
    }

    #[test]
    fn rewrite_dollar_var_refs_only_rewrites_known_variables() {
        let snapshot = snapshot_with(&[("x", serde_json::json!(42))]);
        assert_eq!(rewrite_dollar_var_refs("$.x > 10", &snapshot), "x > 10");
        // `$.y` isn't a snapshot variable, so it's left alone.
        assert_eq!(rewrite_dollar_var_refs("$.y > 10", &snapshot), "$.y > 10");
    }

    #[tokio::test]
    async fn execute_condition_rewrites_dollar_var_before_evaluating() {
        struct CapturingEvaluator {
            last_expr: tokio::sync::Mutex<Option<String>>,
        }

        #[async_trait::async_trait]
        impl ExpressionEvaluator for CapturingEvaluator {
            async fn transform(&self, _expression: &str, _data: &Value) -> Result<Value, ExecutionError> {
                Ok(Value::Null)
            }

            async fn evaluate(&self, expression: &str, _env: &Value) -> Result<bool, ExecutionError> {
                *self.last_expr.lock().await = Some(expression.to_string());
                Ok(true)
            }
        }

        let ctx = ExecutionContext::new();
        ctx.set("x", serde_json::json!(42)).await;
        let evaluator = CapturingEvaluator {
            last_expr: tokio::sync::Mutex::new(None),
        };
        execute_condition("$.x > 10", &ctx, &evaluator).await.unwrap();
        assert_eq!(evaluator.last_expr.lock().await.as_deref(), Some("x > 10"));
    }

    #[tokio::test]
    async fn execute_passthrough_copies_value() {
        let ctx = ExecutionContext::new();
        ctx.set("a", serde_json::json!(1)).await;
        let outputs = execute_passthrough(Some("a"), Some("b"), &ctx).await.unwrap();
        assert_eq!(outputs["b"], serde_json::json!(1));
        let (b, _) = ctx.get("b").await;
        assert_eq!(b, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn execute_passthrough_with_no_vars_is_noop() {
        let ctx = ExecutionContext::new();
        let outputs = execute_passthrough(None, None, &ctx).await.unwrap();
        assert!(outputs.is_empty());
    }
}
