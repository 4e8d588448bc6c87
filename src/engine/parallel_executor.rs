//! Fan-out execution for `Parallel` nodes: branch context isolation, the
//! three merge strategies, and cooperative cancellation across branches.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{info, instrument, warn};

use crate::engine::context::ExecutionContext;
use crate::engine::error::ExecutionError;
use crate::engine::execution::NodeExecution;

/// How a `Parallel` node's branch results and contexts are joined back into
/// the parent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Wait for every branch; fail the node if any branch failed.
    WaitAll,
    /// Wait for every branch; succeed if at least one branch succeeded.
    WaitAny,
    /// Return as soon as the first branch finishes (success or failure);
    /// the remaining branches are cancelled.
    WaitFirst,
}

/// One branch's outcome.
#[derive(Debug, Clone)]
pub struct BranchResult {
    /// Index of the branch within the `Parallel` node's `branches` list.
    pub branch_index: usize,
    /// Variables the branch wrote, deep-copied from its isolated context.
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Error the branch terminated with, if it failed.
    pub error: Option<ExecutionError>,
    /// `NodeExecution` records produced by nodes run inside this branch, in
    /// the order they ran.
    pub node_executions: Vec<NodeExecution>,
}

impl BranchResult {
    /// Whether this branch finished without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The combined result of running every branch of one `Parallel` node.
#[derive(Debug)]
pub struct ParallelOutcome {
    /// Per-branch results, in branch-index order (branches cancelled before
    /// completing under `WaitFirst` are omitted).
    pub branches: Vec<BranchResult>,
    /// The merged variable set to write back into the parent context.
    pub merged_variables: serde_json::Map<String, serde_json::Value>,
}

/// Runs the branches of one `Parallel` node. Generic over the per-node
/// runner so this module stays independent of the scheduler; `run_branch`
/// executes one branch's body sequentially against an isolated context and
/// returns the outputs it produced (or an error).
pub struct ParallelExecutor {
    semaphore: Arc<Semaphore>,
}

impl ParallelExecutor {
    /// Limit concurrently running branches across this executor to
    /// `max_concurrent`.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run every branch under `strategy`, isolating each from `parent` via a
    /// deep-copied context, then merge results back.
    ///
    /// `run_branch(branch_index, isolated_context, cancel)` must run that
    /// branch's node list sequentially and return the `NodeExecution`s it
    /// produced, on success, or those same records alongside the error that
    /// ended the branch.
    #[instrument(skip(self, parent, run_branch))]
    pub async fn execute<F, Fut>(
        &self,
        branches: &[Vec<String>],
        strategy: MergeStrategy,
        parent: &ExecutionContext,
        run_branch: F,
    ) -> Result<ParallelOutcome, ExecutionError>
    where
        F: Fn(usize, Arc<ExecutionContext>, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<NodeExecution>, (ExecutionError, Vec<NodeExecution>)>> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run_branch = Arc::new(run_branch);

        let mut tasks = FuturesUnordered::new();
        for (index, _) in branches.iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let isolated = Arc::new(ExecutionContext::new());
            parent.copy_variables_to(&isolated).await;
            let cancel_rx = cancel_rx.clone();
            let run_branch = run_branch.clone();
            let isolated_for_outputs = isolated.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = run_branch(index, isolated.clone(), cancel_rx).await;
                let outputs = isolated_for_outputs.create_snapshot().await;
                match result {
                    Ok(node_executions) => BranchResult {
                        branch_index: index,
                        outputs,
                        error: None,
                        node_executions,
                    },
                    Err((error, node_executions)) => BranchResult {
                        branch_index: index,
                        outputs,
                        error: Some(error),
                        node_executions,
                    },
                }
            }));
        }

        let mut results = Vec::with_capacity(branches.len());
        // Under `WaitFirst`, the branch that triggers the short-circuit is
        // the only one whose error/outputs count toward the node's own
        // outcome; every other branch result (including stragglers drained
        // below) is kept only for its `NodeExecution` audit trail.
        let mut first_to_finish: Option<BranchResult> = None;
        while let Some(joined) = tasks.next().await {
            let result = match joined {
                Ok(branch_result) => branch_result,
                Err(join_error) => BranchResult {
                    branch_index: results.len(),
                    outputs: serde_json::Map::new(),
                    error: Some(ExecutionError::new(
                        crate::engine::error::ExecutionErrorKind::Execution,
                        format!("branch task panicked: {join_error}"),
                    )),
                    node_executions: Vec::new(),
                },
            };

            let should_stop_early = match strategy {
                MergeStrategy::WaitFirst => true,
                MergeStrategy::WaitAny => result.is_success(),
                MergeStrategy::WaitAll => false,
            };

            if strategy == MergeStrategy::WaitFirst && first_to_finish.is_none() {
                first_to_finish = Some(result.clone());
            }

            results.push(result);

            if should_stop_early {
                info!("parallel node short-circuiting, cancelling remaining branches");
                let _ = cancel_tx.send(true);
                while let Some(joined) = tasks.next().await {
                    if let Ok(late) = joined {
                        results.push(late);
                    }
                }
                break;
            }
        }

        results.sort_by_key(|r| r.branch_index);

        match strategy {
            MergeStrategy::WaitAll => {
                if let Some(failed) = results.iter().find(|r| !r.is_success()) {
                    warn!(branch = failed.branch_index, "parallel node failed under WaitAll");
                    return Err(failed.error.clone().unwrap());
                }
            }
            MergeStrategy::WaitAny => {
                if !results.iter().any(|r| r.is_success()) {
                    let last_error = results
                        .iter()
                        .rev()
                        .find_map(|r| r.error.clone())
                        .unwrap_or_else(|| {
                            ExecutionError::new(
                                crate::engine::error::ExecutionErrorKind::Execution,
                                "all branches failed under WaitAny",
                            )
                        });
                    return Err(last_error);
                }
            }
            MergeStrategy::WaitFirst => {
                if let Some(first) = &first_to_finish {
                    if let Some(error) = &first.error {
                        warn!(branch = first.branch_index, "parallel node failed under WaitFirst");
                        return Err(error.clone());
                    }
                }
            }
        }

        let mut merged = serde_json::Map::new();
        match strategy {
            MergeStrategy::WaitFirst => {
                if let Some(first) = &first_to_finish {
                    merged.extend(first.outputs.clone());
                }
            }
            MergeStrategy::WaitAll | MergeStrategy::WaitAny => {
                for branch in &results {
                    if branch.is_success() {
                        merged.extend(branch.outputs.clone());
                    }
                }
            }
        }

        Ok(ParallelOutcome {
            branches: results,
            merged_variables: merged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn wait_all_merges_every_branch_output() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        let outcome = executor
            .execute(&branches, MergeStrategy::WaitAll, &parent, |index, ctx, _cancel| async move {
                ctx.set(&format!("branch_{index}"), serde_json::json!(index)).await;
                Ok(Vec::new())
            })
            .await
            .unwrap();

        assert_eq!(outcome.branches.len(), 2);
        assert_eq!(outcome.merged_variables["branch_0"], serde_json::json!(0));
        assert_eq!(outcome.merged_variables["branch_1"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn wait_all_fails_if_any_branch_fails() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        let result = executor
            .execute(&branches, MergeStrategy::WaitAll, &parent, |index, _ctx, _cancel| async move {
                if index == 1 {
                    Err((ExecutionError::validation_error("branch 1 broke"), Vec::new()))
                } else {
                    Ok(Vec::new())
                }
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_any_succeeds_if_one_branch_succeeds() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        let outcome = executor
            .execute(&branches, MergeStrategy::WaitAny, &parent, |index, _ctx, _cancel| async move {
                if index == 0 {
                    Err((ExecutionError::validation_error("branch 0 broke"), Vec::new()))
                } else {
                    Ok(Vec::new())
                }
            })
            .await
            .unwrap();

        assert!(outcome.branches.iter().any(|b| b.is_success()));
    }

    #[tokio::test]
    async fn wait_first_cancels_remaining_branches() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()], vec!["n3".to_string()]];
        let cancelled_seen = Arc::new(AtomicUsize::new(0));

        let outcome = executor
            .execute(&branches, MergeStrategy::WaitFirst, &parent, {
                let cancelled_seen = cancelled_seen.clone();
                move |index, _ctx, mut cancel| {
                    let cancelled_seen = cancelled_seen.clone();
                    async move {
                        if index == 0 {
                            return Ok(Vec::new());
                        }
                        let _ = cancel.changed().await;
                        if *cancel.borrow() {
                            cancelled_seen.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Vec::new())
                    }
                }
            })
            .await
            .unwrap();

        assert!(!outcome.branches.is_empty());
    }

    #[tokio::test]
    async fn wait_first_propagates_the_first_finishing_branchs_error() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        let result = executor
            .execute(&branches, MergeStrategy::WaitFirst, &parent, |index, _ctx, mut cancel| async move {
                if index == 0 {
                    return Err((ExecutionError::validation_error("branch 0 broke"), Vec::new()));
                }
                let _ = cancel.changed().await;
                Ok(Vec::new())
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_first_merges_only_the_first_finishing_branchs_outputs() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        let outcome = executor
            .execute(&branches, MergeStrategy::WaitFirst, &parent, |index, ctx, mut cancel| async move {
                if index == 0 {
                    ctx.set("winner", serde_json::json!("branch-0")).await;
                    return Ok(Vec::new());
                }
                let _ = cancel.changed().await;
                ctx.set("loser", serde_json::json!("branch-1")).await;
                Ok(Vec::new())
            })
            .await
            .unwrap();

        assert_eq!(outcome.merged_variables.get("winner"), Some(&serde_json::json!("branch-0")));
        assert!(!outcome.merged_variables.contains_key("loser"));
    }

    #[tokio::test]
    async fn branches_are_isolated_from_each_other() {
        let executor = ParallelExecutor::new(4);
        let parent = ExecutionContext::new();
        parent.set("shared", serde_json::json!(0)).await;
        let branches = vec![vec!["n1".to_string()], vec!["n2".to_string()]];

        executor
            .execute(&branches, MergeStrategy::WaitAll, &parent, |index, ctx, _cancel| async move {
                ctx.set("shared", serde_json::json!(index)).await;
                Ok(Vec::new())
            })
            .await
            .unwrap();

        let (parent_value, _) = parent.get("shared").await;
        assert_eq!(parent_value, Some(serde_json::json!(0)));
    }
}
