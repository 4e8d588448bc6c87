//! The scheduler: traversal-mode selection, tool-server connection
//! lifecycle, and the dispatch loop that drives one `Execution` from
//! `start` to a terminal node.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::instrument;

use crate::engine::context::ExecutionContext;
use crate::engine::error::{ExecutionError, ExecutionErrorKind};
use crate::engine::events::{Event, EventKind, EventMonitor};
use crate::engine::execution::{Execution, NodeExecution};
use crate::engine::loop_executor::execute_loop;
use crate::engine::node_executor;
use crate::engine::parallel_executor::ParallelExecutor;
use crate::engine::progress::ProgressTracker;
use crate::engine::retry::RetryExecutor;
use crate::engine::traits::{ExpressionEvaluator, ToolServerRegistry};
use crate::engine::EngineConfig;
use crate::graph::node::NodeKind;
use crate::graph::{GraphError, Workflow, WorkflowGraph};

/// The traversal strategy selected once per compiled graph (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    /// Kahn's-algorithm linear order; used when no `condition` node exists.
    Topological,
    /// Start-at-`start`, follow `NextNodes` after every node; used whenever
    /// any `condition` node is present.
    EdgeDirected,
}

fn cancelled_error() -> ExecutionError {
    ExecutionError::new(ExecutionErrorKind::Execution, "execution cancelled").recoverable()
}

/// Variables present in `after` but absent, or different, in `before`.
fn snapshot_diff(
    before: &serde_json::Map<String, serde_json::Value>,
    after: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut diff = serde_json::Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            diff.insert(key.clone(), value.clone());
        }
    }
    diff
}

/// What running one node's body produced.
struct NodeBodyOutcome {
    /// Retries consumed (always `0` for node kinds `retry` doesn't wrap).
    retries_consumed: u32,
    /// Variables the body wrote, diffed against the context before it ran.
    outputs: serde_json::Map<String, serde_json::Value>,
    /// `NodeExecution` records for nodes run inside a `Parallel` branch or
    /// `Loop` body, in branch/iteration order, to be appended to the parent
    /// execution alongside the node's own record.
    child_node_executions: Vec<NodeExecution>,
}

/// Recursively dispatches one node's body: the piece of the scheduler
/// reused by branch and loop-body execution, since those run their own node
/// lists against isolated or scoped contexts. Boxed because a `Parallel`
/// node's branch can itself contain a `Parallel` node.
#[derive(Clone)]
struct NodeBodyRunner {
    execution_id: String,
    workflow: Arc<Workflow>,
    registry: Arc<dyn ToolServerRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    max_concurrent_branches: usize,
    /// Wraps `Tool` dispatch; the only node kind whose failures are
    /// classified `Connection` and thus typically transient (§ EngineConfig
    /// `default_retry`).
    retry: Arc<RetryExecutor>,
}

impl NodeBodyRunner {
    /// Runs one node's body. `precomputed_condition` lets a caller that
    /// already evaluated a `Condition` node's expression (to choose the next
    /// edge) hand the result in instead of evaluating it a second time here;
    /// pass `None` for every other node kind, or when no such caller exists.
    fn run_node_body_inner<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a ExecutionContext,
        cancel: &'a watch::Receiver<bool>,
        precomputed_condition: Option<bool>,
    ) -> BoxFuture<'a, Result<NodeBodyOutcome, ExecutionError>> {
        async move {
            if *cancel.borrow() {
                return Err(cancelled_error());
            }

            let node = self
                .workflow
                .get_node(node_id)
                .ok_or_else(|| ExecutionError::validation_error(format!("node not found: {node_id}")))?;

            let mut retries_consumed = 0u32;
            let mut child_node_executions = Vec::new();
            let before = context.create_snapshot().await;

            match &node.kind {
                NodeKind::Start => {
                    node_executor::execute_start().await?;
                }
                NodeKind::End { return_expr } => {
                    let outputs = node_executor::execute_end(return_expr.as_deref(), context).await?;
                    for (name, value) in outputs {
                        context.set(&name, value).await;
                    }
                }
                NodeKind::Tool {
                    server_id,
                    tool_name,
                    params,
                    output_var,
                } => {
                    let (result, metrics) = self
                        .retry
                        .execute_with_metrics(cancel.clone(), || {
                            node_executor::execute_tool(server_id, tool_name, params, output_var, context, &*self.registry)
                        })
                        .await;
                    retries_consumed = (metrics.attempts.len() as u32).saturating_sub(1);
                    result.ok_or_else(|| {
                        metrics
                            .attempts
                            .last()
                            .and_then(|a| a.error.clone())
                            .unwrap_or_else(|| ExecutionError::new(ExecutionErrorKind::Connection, "retries exhausted"))
                    })?;
                }
                NodeKind::Transform {
                    input_var,
                    expression,
                    output_var,
                } => {
                    node_executor::execute_transform(input_var, expression, output_var, context, &*self.evaluator)
                        .await?;
                }
                NodeKind::Condition { expression } => {
                    if precomputed_condition.is_none() {
                        node_executor::execute_condition(expression, context, &*self.evaluator).await?;
                    }
                }
                NodeKind::Passthrough { input_var, output_var } => {
                    node_executor::execute_passthrough(input_var.as_deref(), output_var.as_deref(), context).await?;
                }
                NodeKind::Parallel {
                    branches,
                    merge_strategy,
                } => {
                    let executor = ParallelExecutor::new(self.max_concurrent_branches);
                    let this = self.clone();
                    let branches_owned = branches.clone();
                    let outcome = executor
                        .execute(branches, *merge_strategy, context, move |index, branch_ctx, branch_cancel| {
                            let this = this.clone();
                            let branch_nodes = branches_owned[index].clone();
                            async move {
                                let mut node_executions = Vec::new();
                                for nid in &branch_nodes {
                                    match this.track_node(nid, &branch_ctx, &branch_cancel).await {
                                        Ok(execs) => node_executions.extend(execs),
                                        Err((error, execs)) => {
                                            node_executions.extend(execs);
                                            return Err((error, node_executions));
                                        }
                                    }
                                }
                                Ok(node_executions)
                            }
                        })
                        .await?;
                    for branch in &outcome.branches {
                        child_node_executions.extend(branch.node_executions.clone());
                    }
                    for (name, value) in outcome.merged_variables {
                        context.set(&name, value).await;
                    }
                }
                NodeKind::Loop {
                    collection_var,
                    iteration_var,
                    body,
                    break_condition,
                } => {
                    let this = self.clone();
                    let body_owned = body.clone();
                    let cancel_owned = cancel.clone();
                    let outcome = execute_loop(
                        collection_var,
                        iteration_var,
                        break_condition.as_deref(),
                        context,
                        &*self.evaluator,
                        move |_index, _element| {
                            let this = this.clone();
                            let body_owned = body_owned.clone();
                            let cancel_owned = cancel_owned.clone();
                            async move {
                                let mut node_executions = Vec::new();
                                for nid in &body_owned {
                                    let execs = this.track_node(nid, context, &cancel_owned).await.map_err(|(error, execs)| {
                                        node_executions.extend(execs);
                                        error
                                    })?;
                                    node_executions.extend(execs);
                                }
                                Ok(node_executions)
                            }
                        },
                    )
                    .await?;
                    child_node_executions = outcome.node_executions;
                }
            }

            let after = context.create_snapshot().await;
            Ok(NodeBodyOutcome {
                retries_consumed,
                outputs: snapshot_diff(&before, &after),
                child_node_executions,
            })
        }
        .boxed()
    }

    /// Runs one node's body with no precomputed condition result. Used by
    /// nested dispatch (branch/loop bodies), which always re-evaluates any
    /// `Condition` node it encounters.
    fn run_node_body<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a ExecutionContext,
        cancel: &'a watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<NodeBodyOutcome, ExecutionError>> {
        self.run_node_body_inner(node_id, context, cancel, None)
    }

    /// Runs `node_id` as a standalone dispatch, building its own
    /// `NodeExecution` record locally (since branch/loop bodies run against
    /// isolated or scoped contexts with no access to the real `Execution`).
    /// On success, returns that record followed by any nested records its
    /// body produced, in order. On failure, returns the error alongside
    /// whatever records were produced before it (just the failed node's own
    /// record, for a leaf node kind).
    fn track_node<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a ExecutionContext,
        cancel: &'a watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<Vec<NodeExecution>, (ExecutionError, Vec<NodeExecution>)>> {
        async move {
            let node = match self.workflow.get_node(node_id) {
                Some(node) => node,
                None => {
                    return Err((
                        ExecutionError::validation_error(format!("node not found: {node_id}")),
                        Vec::new(),
                    ))
                }
            };
            let type_tag = node_executor::type_tag_for(&node.kind);
            let mut ne = NodeExecution::new(&self.execution_id, node_id, type_tag);
            ne.start();

            match self.run_node_body(node_id, context, cancel).await {
                Ok(outcome) => {
                    ne.retry_count = outcome.retries_consumed;
                    ne.complete(outcome.outputs);
                    let mut all = vec![ne];
                    all.extend(outcome.child_node_executions);
                    Ok(all)
                }
                Err(error) => {
                    ne.fail(error.clone());
                    Err((error, vec![ne]))
                }
            }
        }
        .boxed()
    }
}

/// Drives one compiled workflow from `start` to a terminal `Execution`
/// status.
pub struct Scheduler {
    workflow: Arc<Workflow>,
    graph: WorkflowGraph,
    mode: TraversalMode,
    config: EngineConfig,
    registry: Arc<dyn ToolServerRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Scheduler {
    /// Compile `workflow` and select its traversal mode once.
    pub fn new(
        workflow: Workflow,
        registry: Arc<dyn ToolServerRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: EngineConfig,
    ) -> Result<Self, GraphError> {
        let graph = workflow.compile()?;
        let mode = if workflow.has_condition_node() {
            TraversalMode::EdgeDirected
        } else {
            TraversalMode::Topological
        };
        Ok(Self {
            workflow: Arc::new(workflow),
            graph,
            mode,
            config,
            registry,
            evaluator,
        })
    }

    /// The traversal mode selected for this scheduler's graph.
    pub fn mode(&self) -> TraversalMode {
        self.mode
    }

    /// Run `execution` to completion against `input`. `cancel` is polled
    /// before every node dispatch.
    #[instrument(skip(self, execution, events, progress, cancel))]
    pub async fn run(
        &self,
        execution: &mut Execution,
        input: serde_json::Map<String, serde_json::Value>,
        events: &EventMonitor,
        progress: &ProgressTracker,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ExecutionError> {
        let merged = self.workflow.merge_defaults(input);
        for (name, value) in merged {
            execution.context.set(&name, value).await;
        }

        for descriptor in &self.workflow.tool_servers {
            if let Ok(server) = self.registry.get(&descriptor.id).await {
                if let Err(error) = server.connect().await {
                    self.close_tool_servers().await;
                    return Err(error);
                }
            }
        }

        execution
            .start()
            .map_err(|e| ExecutionError::new(ExecutionErrorKind::Execution, e.to_string()))?;
        events
            .emit(Event::new(EventKind::ExecutionStarted, format!("execution {} started", execution.id)))
            .await;

        let runner = NodeBodyRunner {
            execution_id: execution.id.clone(),
            workflow: self.workflow.clone(),
            registry: self.registry.clone(),
            evaluator: self.evaluator.clone(),
            max_concurrent_branches: self.config.max_concurrent_branches,
            retry: Arc::new(RetryExecutor::new(self.config.default_retry.clone())),
        };

        let order = match self.mode {
            TraversalMode::Topological => self
                .graph
                .topological_order()
                .map_err(|e| ExecutionError::validation_error(e.to_string()))?,
            TraversalMode::EdgeDirected => Vec::new(),
        };

        let dispatch_result = match self.mode {
            TraversalMode::Topological => self.run_topological(&order, execution, &runner, events, progress, &mut cancel).await,
            TraversalMode::EdgeDirected => self.run_edge_directed(execution, &runner, events, progress, &mut cancel).await,
        };

        self.close_tool_servers().await;

        match dispatch_result {
            Ok(()) => {
                let return_value = execution.context.get("return_value").await.0;
                execution
                    .complete(return_value)
                    .map_err(|e| ExecutionError::new(ExecutionErrorKind::Execution, e.to_string()))?;
                events
                    .emit(Event::new(EventKind::ExecutionCompleted, "execution completed"))
                    .await;
                Ok(())
            }
            Err(DispatchOutcome::Cancelled) => {
                let _ = execution.cancel();
                events
                    .emit(Event::new(EventKind::ExecutionCancelled, "execution cancelled"))
                    .await;
                Ok(())
            }
            Err(DispatchOutcome::Failed(error)) => {
                let _ = execution.fail(error.clone());
                events
                    .emit(Event::new(EventKind::ExecutionFailed, error.message.clone()))
                    .await;
                Err(error)
            }
        }
    }

    async fn close_tool_servers(&self) {
        for descriptor in &self.workflow.tool_servers {
            if let Ok(server) = self.registry.get(&descriptor.id).await {
                let _ = server.disconnect().await;
            }
        }
    }

    async fn dispatch_one(
        &self,
        node_id: &str,
        execution: &mut Execution,
        runner: &NodeBodyRunner,
        events: &EventMonitor,
        progress: &ProgressTracker,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Option<bool>, DispatchOutcome> {
        if *cancel.borrow() {
            return Err(DispatchOutcome::Cancelled);
        }

        let node = self
            .workflow
            .get_node(node_id)
            .ok_or_else(|| DispatchOutcome::Failed(ExecutionError::validation_error(format!("node not found: {node_id}"))))?;
        let type_tag = node_executor::type_tag_for(&node.kind);

        let mut ne = NodeExecution::new(&execution.id, node_id, type_tag);
        ne.start();
        progress.on_node_started(node_id);
        events
            .emit(Event::new(EventKind::NodeStarted, format!("node '{node_id}' started")).with_node(node_id))
            .await;

        let condition_result = if let NodeKind::Condition { expression } = &node.kind {
            Some(
                node_executor::execute_condition(expression, &execution.context, &*self.evaluator)
                    .await
                    .map_err(DispatchOutcome::Failed)?,
            )
        } else {
            None
        };

        let body_future = runner.run_node_body_inner(node_id, &execution.context, cancel, condition_result);
        let body_result = match self.config.default_node_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, body_future).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timeout_error(
                    &format!("node '{node_id}' dispatch"),
                    timeout,
                    format!("node '{node_id}' did not finish within {timeout:?}"),
                )
                .with_node(node_id)),
            },
            None => body_future.await,
        };

        match body_result {
            Ok(outcome) => {
                ne.retry_count = outcome.retries_consumed;
                ne.complete(outcome.outputs);
                progress.on_node_completed(node_id);
                events
                    .emit(Event::new(EventKind::NodeCompleted, format!("node '{node_id}' completed")).with_node(node_id))
                    .await;
                execution
                    .add_node_execution(ne)
                    .map_err(|e| DispatchOutcome::Failed(ExecutionError::new(ExecutionErrorKind::Execution, e.to_string())))?;
                for child in outcome.child_node_executions {
                    let _ = execution.add_node_execution(child);
                }
                Ok(condition_result)
            }
            Err(error) => {
                ne.fail(error.clone());
                progress.on_node_failed(node_id);
                events
                    .emit(Event::new(EventKind::NodeFailed, format!("node '{node_id}' failed")).with_node(node_id))
                    .await;
                let _ = execution.add_node_execution(ne);
                Err(DispatchOutcome::Failed(error))
            }
        }
    }

    async fn run_topological(
        &self,
        order: &[String],
        execution: &mut Execution,
        runner: &NodeBodyRunner,
        events: &EventMonitor,
        progress: &ProgressTracker,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchOutcome> {
        for node_id in order {
            self.dispatch_one(node_id, execution, runner, events, progress, cancel).await?;
        }
        Ok(())
    }

    async fn run_edge_directed(
        &self,
        execution: &mut Execution,
        runner: &NodeBodyRunner,
        events: &EventMonitor,
        progress: &ProgressTracker,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchOutcome> {
        let mut current = self.graph.start_id().to_string();
        loop {
            let condition_result = self
                .dispatch_one(&current, execution, runner, events, progress, cancel)
                .await?;

            let edges = self.graph.edges_from(&current);
            let next = match condition_result {
                Some(result) => {
                    let label = if result { "true" } else { "false" };
                    edges
                        .iter()
                        .find(|e| e.label.as_deref() == Some(label))
                        .or_else(|| edges.first())
                        .map(|e| e.to.clone())
                }
                None => edges.first().map(|e| e.to.clone()),
            };

            match next {
                Some(next_id) => current = next_id,
                None => break,
            }
        }
        Ok(())
    }
}

enum DispatchOutcome {
    Cancelled,
    Failed(ExecutionError),
}
