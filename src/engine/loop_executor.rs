//! `Loop` node execution: iterate a collection variable, scope the current
//! element and its index, honor an optional break condition, and clean up
//! scoped variables on exit.

use tracing::{debug, instrument};

use crate::engine::context::ExecutionContext;
use crate::engine::error::{ExecutionError, ExecutionErrorKind};
use crate::engine::execution::NodeExecution;
use crate::engine::traits::ExpressionEvaluator;

/// Outcome of running one `Loop` node to completion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoopOutcome {
    /// Number of iterations attempted, including the one in which a break
    /// condition fired (that iteration's body never ran, but the iteration
    /// itself counts).
    pub iteration_count: usize,
    /// `true` if a break condition fired before the collection was
    /// exhausted.
    pub broken: bool,
    /// The 0-based index the loop broke at, if it broke.
    pub break_index: Option<usize>,
    /// Per-iteration output snapshots: the variables each iteration's body
    /// added or changed, in iteration order. The iteration that triggered a
    /// break has no entry since its body never ran.
    #[serde(skip)]
    pub iterations: Vec<serde_json::Map<String, serde_json::Value>>,
    /// `NodeExecution` records produced by nodes run inside the loop body,
    /// across every iteration, in iteration order.
    #[serde(skip)]
    pub node_executions: Vec<NodeExecution>,
}

fn iteration_outputs(
    before: &serde_json::Map<String, serde_json::Value>,
    after: &serde_json::Map<String, serde_json::Value>,
    iteration_var: &str,
    index_var: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut diff = serde_json::Map::new();
    for (key, value) in after {
        if key == iteration_var || key == index_var {
            continue;
        }
        if before.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    diff
}

/// Runs a `Loop` node. `run_body(index, element)` executes the loop body's
/// node list for one iteration against `context` (which already has
/// `iteration_var` and `<iteration_var>_index` bound when it's called), and
/// returns the `NodeExecution`s that iteration produced.
#[instrument(skip(context, evaluator, run_body))]
pub async fn execute_loop<F, Fut>(
    collection_var: &str,
    iteration_var: &str,
    break_condition: Option<&str>,
    context: &ExecutionContext,
    evaluator: &dyn ExpressionEvaluator,
    mut run_body: F,
) -> Result<LoopOutcome, ExecutionError>
where
    F: FnMut(usize, serde_json::Value) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<NodeExecution>, ExecutionError>>,
{
    let (collection, present) = context.get(collection_var).await;
    if !present {
        return Err(ExecutionError::new(
            ExecutionErrorKind::Execution,
            format!("loop collection variable '{collection_var}' is undefined"),
        ));
    }
    let items = match collection {
        Some(serde_json::Value::Array(items)) => items,
        Some(other) => {
            return Err(ExecutionError::data_error(
                collection_var,
                &other,
                format!("loop collection variable '{collection_var}' is not an array"),
            ))
        }
        None => Vec::new(),
    };

    let index_var = format!("{iteration_var}_index");
    let mut iteration_count = 0;
    let mut broken = false;
    let mut break_index = None;
    let mut iterations = Vec::new();
    let mut node_executions = Vec::new();

    for (index, element) in items.into_iter().enumerate() {
        context.set(iteration_var, element.clone()).await;
        context.set(&index_var, serde_json::json!(index)).await;

        if let Some(expr) = break_condition {
            let snapshot = context.create_snapshot().await;
            if evaluator.evaluate(expr, &serde_json::Value::Object(snapshot)).await? {
                broken = true;
                break_index = Some(index);
                iteration_count = index + 1;
                debug!(index, "loop break condition satisfied, stopping before body");
                break;
            }
        }

        let before = context.create_snapshot().await;
        let body_executions = run_body(index, element).await?;
        node_executions.extend(body_executions);
        let after = context.create_snapshot().await;
        iterations.push(iteration_outputs(&before, &after, iteration_var, &index_var));
        iteration_count += 1;
    }

    context.delete(iteration_var).await;
    context.delete(&index_var).await;

    Ok(LoopOutcome {
        iteration_count,
        broken,
        break_index,
        iterations,
        node_executions,
    })
}
