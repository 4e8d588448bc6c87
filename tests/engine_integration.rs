//! End-to-end coverage exercising the public surface together: a compiled
//! workflow driven through `Scheduler::run`, observed via `EventMonitor` and
//! `ProgressTracker`, with `AuditTrail` reconstructed afterward.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use workflow_engine::engine::error::{ExecutionError, ExecutionErrorKind};
use workflow_engine::engine::events::{EventKind, EventMonitor};
use workflow_engine::engine::execution::{Execution, ExecutionStatus};
use workflow_engine::engine::progress::ProgressTracker;
use workflow_engine::engine::retry::{RetryConfig, RetryExecutor};
use workflow_engine::engine::traits::{
    EchoToolServer, ExpressionEvaluator, IdentityEvaluator, InMemoryToolRegistry, ToolServer, ToolServerRegistry,
};
use workflow_engine::engine::audit::AuditTrail;
use workflow_engine::engine::parallel_executor::MergeStrategy;
use workflow_engine::engine::scheduler::{Scheduler, TraversalMode};
use workflow_engine::engine::EngineConfig;
use workflow_engine::graph::node::{Node, NodeKind};
use workflow_engine::graph::{Edge, Workflow};

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn evaluator() -> Arc<dyn ExpressionEvaluator> {
    Arc::new(IdentityEvaluator)
}

#[tokio::test]
async fn linear_four_node_workflow_runs_to_completion_with_full_progress() {
    let workflow = Workflow {
        id: "linear".into(),
        version: "1".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start),
            Node::new(
                "to_greeting",
                NodeKind::Transform {
                    input_var: "input".into(),
                    expression: "name".into(),
                    output_var: "name".into(),
                },
            ),
            Node::new(
                "echo",
                NodeKind::Tool {
                    server_id: "srv".into(),
                    tool_name: "greet".into(),
                    params: serde_json::Map::new(),
                    output_var: "greeting".into(),
                },
            ),
            Node::new(
                "end",
                NodeKind::End {
                    return_expr: Some("${name}".into()),
                },
            ),
        ],
        edges: vec![
            Edge::direct("start", "to_greeting"),
            Edge::direct("to_greeting", "echo"),
            Edge::direct("echo", "end"),
        ],
        variables: vec![],
        tool_servers: vec![],
    };

    let mut registry = InMemoryToolRegistry::new();
    registry.register("srv", Arc::new(EchoToolServer::new(vec!["greet".into()])));
    let scheduler = Scheduler::new(workflow, Arc::new(registry), evaluator(), EngineConfig::default()).unwrap();
    assert_eq!(scheduler.mode(), TraversalMode::Topological);

    let mut execution = Execution::new("linear", "1");
    let mut input = serde_json::Map::new();
    input.insert("input".into(), serde_json::json!({"name": "ada"}));

    let events = EventMonitor::new();
    let mut sub = events.subscribe().await;
    let progress = ProgressTracker::new(4);

    scheduler
        .run(&mut execution, input, &events, &progress, no_cancel())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.return_value, Some(serde_json::json!("ada")));
    assert_eq!(execution.node_executions.len(), 4);
    assert_eq!(progress.get_progress().percent, 100.0);

    let first_event = sub.receiver.recv().await.unwrap();
    assert_eq!(first_event.kind, EventKind::ExecutionStarted);
}

#[tokio::test]
async fn condition_split_takes_the_matching_branch_and_skips_the_other() {
    let workflow = Workflow {
        id: "branching".into(),
        version: "1".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start),
            Node::new(
                "is_adult",
                NodeKind::Condition {
                    expression: "true".into(),
                },
            ),
            Node::new(
                "adult_end",
                NodeKind::End {
                    return_expr: Some("adult".into()),
                },
            ),
            Node::new(
                "minor_end",
                NodeKind::End {
                    return_expr: Some("minor".into()),
                },
            ),
        ],
        edges: vec![
            Edge::direct("start", "is_adult"),
            Edge::labeled("is_adult", "adult_end", "true"),
            Edge::labeled("is_adult", "minor_end", "false"),
        ],
        variables: vec![],
        tool_servers: vec![],
    };

    let registry: Arc<dyn ToolServerRegistry> = Arc::new(InMemoryToolRegistry::new());
    let scheduler = Scheduler::new(workflow, registry, evaluator(), EngineConfig::default()).unwrap();
    assert_eq!(scheduler.mode(), TraversalMode::EdgeDirected);

    let mut execution = Execution::new("branching", "1");
    let events = EventMonitor::new();
    let progress = ProgressTracker::new(3);

    scheduler
        .run(&mut execution, serde_json::Map::new(), &events, &progress, no_cancel())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.node_executions.iter().any(|n| n.node_id == "adult_end"));
    assert!(!execution.node_executions.iter().any(|n| n.node_id == "minor_end"));
}

#[tokio::test]
async fn parallel_wait_all_merges_both_branch_outputs_back_into_context() {
    let workflow = Workflow {
        id: "fanout".into(),
        version: "1".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start),
            Node::new(
                "fanout",
                NodeKind::Parallel {
                    branches: vec![vec!["to_r1".into()], vec!["to_r2".into()]],
                    merge_strategy: MergeStrategy::WaitAll,
                },
            ),
            Node::new(
                "to_r1",
                NodeKind::Passthrough {
                    input_var: Some("seed".into()),
                    output_var: Some("r1".into()),
                },
            ),
            Node::new(
                "to_r2",
                NodeKind::Passthrough {
                    input_var: Some("seed".into()),
                    output_var: Some("r2".into()),
                },
            ),
            Node::new(
                "end",
                NodeKind::End {
                    return_expr: Some("${r1}".into()),
                },
            ),
        ],
        edges: vec![Edge::direct("start", "fanout"), Edge::direct("fanout", "end")],
        variables: vec![],
        tool_servers: vec![],
    };

    let registry: Arc<dyn ToolServerRegistry> = Arc::new(InMemoryToolRegistry::new());
    let scheduler = Scheduler::new(workflow, registry, evaluator(), EngineConfig::default()).unwrap();

    let mut execution = Execution::new("fanout", "1");
    let mut input = serde_json::Map::new();
    input.insert("seed".into(), serde_json::json!(7));
    let events = EventMonitor::new();
    let progress = ProgressTracker::new(3);

    scheduler
        .run(&mut execution, input, &events, &progress, no_cancel())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let (r1, r1_present) = execution.context.get("r1").await;
    let (r2, r2_present) = execution.context.get("r2").await;
    assert!(r1_present && r2_present);
    assert_eq!(r1, Some(serde_json::json!(7)));
    assert_eq!(r2, Some(serde_json::json!(7)));

    let branch_node_ids: Vec<&str> = execution.node_executions.iter().map(|ne| ne.node_id.as_str()).collect();
    assert!(branch_node_ids.contains(&"to_r1"));
    assert!(branch_node_ids.contains(&"to_r2"));
}

struct FlakyConnectionServer {
    tool: &'static str,
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl ToolServer for FlakyConnectionServer {
    async fn connect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn discover_tools(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(vec![self.tool.to_string()])
    }

    async fn invoke(&self, tool: &str, params: &serde_json::Value) -> Result<serde_json::Value, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
            .is_ok()
        {
            return Err(ExecutionError::tool_error(
                "flaky",
                tool,
                params,
                "connection refused",
            ));
        }
        Ok(serde_json::json!({"ok": true}))
    }

    async fn disconnect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

#[tokio::test]
async fn retry_executor_recovers_a_classified_connection_error_after_two_failures() {
    let server = Arc::new(FlakyConnectionServer {
        tool: "fetch",
        remaining_failures: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });

    let config = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        ..Default::default()
    };
    let executor = RetryExecutor::with_seed(config, 11);

    let started = std::time::Instant::now();
    let (result, metrics) = executor
        .execute_with_metrics(no_cancel(), || {
            let server = server.clone();
            async move { server.invoke("fetch", &serde_json::json!({})).await }
        })
        .await;
    let elapsed = started.elapsed();

    let value = result.unwrap();
    assert_eq!(value, serde_json::json!({"ok": true}));
    assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    assert!(metrics.succeeded);
    assert_eq!(metrics.attempts.len(), 3);
    assert_eq!(metrics.attempts.iter().filter(|a| a.error.is_some()).count(), 2);
    // Two waits of ~10ms and ~20ms at minimum jitter (0.75x): floor is ~22.5ms.
    assert!(elapsed >= Duration::from_millis(15));

    let first_error = metrics.attempts[0].error.as_ref().unwrap();
    assert_eq!(first_error.kind, ExecutionErrorKind::Connection);
    assert!(first_error.recoverable);
    assert_eq!(first_error.classify().severity, workflow_engine::engine::error::Severity::Medium);
}

#[tokio::test]
async fn loop_with_break_condition_stops_early_and_runs_to_completion() {
    use workflow_engine::engine::context::ExecutionContext;
    use workflow_engine::engine::loop_executor::execute_loop;

    let ctx = ExecutionContext::new();
    ctx.set("items", serde_json::json!([1, 2, 3, 4, 5])).await;

    struct BreakOnThree;
    #[async_trait]
    impl ExpressionEvaluator for BreakOnThree {
        async fn transform(&self, _e: &str, _d: &serde_json::Value) -> Result<serde_json::Value, ExecutionError> {
            unreachable!("not exercised by this scenario")
        }
        async fn evaluate(&self, _e: &str, env: &serde_json::Value) -> Result<bool, ExecutionError> {
            Ok(env["item"] == serde_json::json!(3))
        }
    }

    let visited = Arc::new(std::sync::Mutex::new(Vec::new()));
    let visited_clone = visited.clone();
    let outcome = execute_loop("items", "item", Some("item == 3"), &ctx, &BreakOnThree, |_index, element| {
        let visited = visited_clone.clone();
        async move {
            visited.lock().unwrap().push(element);
            Ok(Vec::new())
        }
    })
    .await
    .unwrap();

    assert!(outcome.broken);
    assert_eq!(outcome.iteration_count, 3);
    assert_eq!(*visited.lock().unwrap(), vec![serde_json::json!(1), serde_json::json!(2)]);
    let (item, present) = ctx.get("item").await;
    assert!(!present && item.is_none());
}

#[tokio::test]
async fn scheduler_appends_loop_body_node_executions_to_the_parent_execution() {
    let workflow = Workflow {
        id: "loopy".into(),
        version: "1".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start),
            Node::new(
                "each",
                NodeKind::Loop {
                    collection_var: "items".into(),
                    iteration_var: "item".into(),
                    body: vec!["double".into()],
                    break_condition: None,
                },
            ),
            Node::new(
                "double",
                NodeKind::Transform {
                    input_var: "item".into(),
                    expression: "item".into(),
                    output_var: "seen".into(),
                },
            ),
            Node::new("end", NodeKind::End { return_expr: None }),
        ],
        edges: vec![Edge::direct("start", "each"), Edge::direct("each", "end")],
        variables: vec![],
        tool_servers: vec![],
    };

    let registry: Arc<dyn ToolServerRegistry> = Arc::new(InMemoryToolRegistry::new());
    let scheduler = Scheduler::new(workflow, registry, evaluator(), EngineConfig::default()).unwrap();

    let mut execution = Execution::new("loopy", "1");
    let mut input = serde_json::Map::new();
    input.insert("items".into(), serde_json::json!([1, 2, 3]));
    let events = EventMonitor::new();
    let progress = ProgressTracker::new(2);

    scheduler
        .run(&mut execution, input, &events, &progress, no_cancel())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let body_executions: Vec<_> = execution
        .node_executions
        .iter()
        .filter(|ne| ne.node_id == "double")
        .collect();
    assert_eq!(body_executions.len(), 3);
}

#[tokio::test]
async fn audit_trail_reconstructs_a_failed_execution_with_error_and_variable_history() {
    let workflow = Workflow {
        id: "failing".into(),
        version: "1".into(),
        nodes: vec![
            Node::new("start", NodeKind::Start),
            Node::new(
                "bad_transform",
                NodeKind::Transform {
                    input_var: "missing".into(),
                    expression: "anything".into(),
                    output_var: "out".into(),
                },
            ),
            Node::new("end", NodeKind::End { return_expr: None }),
        ],
        edges: vec![Edge::direct("start", "bad_transform"), Edge::direct("bad_transform", "end")],
        variables: vec![],
        tool_servers: vec![],
    };

    let registry: Arc<dyn ToolServerRegistry> = Arc::new(InMemoryToolRegistry::new());
    let scheduler = Scheduler::new(workflow, registry, evaluator(), EngineConfig::default()).unwrap();

    let mut execution = Execution::new("failing", "1");
    execution.context.set("seed", serde_json::json!(1)).await;
    let events = EventMonitor::new();
    let progress = ProgressTracker::new(3);

    let result = scheduler
        .run(&mut execution, serde_json::Map::new(), &events, &progress, no_cancel())
        .await;

    assert!(result.is_err());
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let history = execution.context.get_variable_history().await;
    let trail = AuditTrail::reconstruct(&execution, &history);

    assert_eq!(trail.error_count, 1);
    assert_eq!(trail.variable_change_count, history.len());
    assert!(matches!(trail.get_error_events().first().unwrap().kind, EventKind::NodeFailed));
    assert!(trail.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let report = trail.to_text_report();
    assert!(report.contains("1 errors"));
    let json = trail.to_json().unwrap();
    assert!(json.contains("\"error_count\": 1"));
}
