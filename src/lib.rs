//! # Workflow Engine Core
//!
//! The execution core of a DAG-based workflow runtime: a scheduler that walks a
//! declarative graph of typed nodes against a shared, observable variable
//! context, dispatches tool/transform/condition/parallel/loop work, and leaves
//! behind a reconstructable audit trail of everything that happened.
//!
//! ## Key subsystems
//!
//! - **Scheduler** ([`engine::scheduler`]): topological or edge-directed graph
//!   traversal, condition-branch resolution.
//! - **Parallel/loop executors** ([`engine::parallel_executor`],
//!   [`engine::loop_executor`]): branch fan-out with wait-all/wait-any/wait-first
//!   merge strategies, per-branch context isolation.
//! - **Observability** ([`engine::events`], [`engine::progress`],
//!   [`engine::snapshot`], [`engine::audit`]): a non-blocking filtered event
//!   bus, an atomic progress tracker, point-in-time variable snapshots, and
//!   after-the-fact audit reconstruction.
//! - **Retry & error classification** ([`engine::retry`], [`engine::error`]):
//!   exponential backoff with jitter, allow/deny pattern matching, and a rich
//!   error model.

#![warn(missing_docs)]

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Top-level error type aggregating every submodule's error enum.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Graph structure error (cycles, missing nodes, dangling edges).
    #[error("graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// An execution-level error produced by a node executor or the scheduler.
    #[error("execution error: {0}")]
    Execution(#[from] engine::error::ExecutionError),

    /// Retries were exhausted without success.
    #[error("retry exhausted: {0}")]
    RetryExhausted(#[from] engine::retry::RetryExhaustedError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Graph data model: nodes, edges, workflow definition, validation.
pub mod graph;

/// Execution engine: context, scheduler, node executors, observability, retry.
pub mod engine;

/// Execution persistence: the `ExecutionRepository` trait and an in-memory
/// implementation used by tests and simple embedders.
pub mod checkpoint;
