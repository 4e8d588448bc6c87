//! The execution engine: scheduling, node dispatch, parallel/loop fan-out,
//! observability, and retry/error handling for one compiled workflow graph.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::retry::RetryConfig;

pub mod audit;
pub mod context;
pub mod error;
pub mod events;
pub mod execution;
pub mod loop_executor;
pub mod node_executor;
pub mod parallel_executor;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod traits;

/// Engine-wide defaults, overridable per call. Mirrors the ambient
/// configuration surface (see [`crate::engine::retry::RetryConfig`] for the
/// per-operation knobs this wraps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded capacity of each event-bus subscriber channel.
    pub event_buffer_capacity: usize,
    /// Maximum number of parallel branches running concurrently across the
    /// whole engine (enforced with a `tokio::sync::Semaphore`).
    pub max_concurrent_branches: usize,
    /// Default wall-clock timeout applied to a node dispatch when the node
    /// itself specifies none. `None` means no default timeout.
    pub default_node_timeout: Option<Duration>,
    /// Default retry policy wrapping every `Tool` node dispatch, since a
    /// tool invocation is the one node kind whose failures are typically
    /// transient (a `Connection`-classified error).
    pub default_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: events::DEFAULT_SUBSCRIBER_CAPACITY,
            max_concurrent_branches: num_cpus::get().max(1) * 4,
            default_node_timeout: Some(Duration::from_secs(300)),
            default_retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_scales_branches_with_cpus() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent_branches >= 4);
        assert_eq!(config.event_buffer_capacity, events::DEFAULT_SUBSCRIBER_CAPACITY);
    }
}
