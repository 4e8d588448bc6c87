//! Non-blocking, filtered pub/sub event bus for one execution.
//!
//! Emit never blocks the scheduler: each subscriber owns a bounded
//! [`tokio::sync::mpsc`] channel and delivery uses `try_send`, so a slow
//! subscriber drops events instead of stalling the emitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::engine::context::ExecutionContext;
use crate::engine::progress::{Progress, ProgressTracker};

/// Default bounded capacity for a subscriber's delivery slot (§4.6).
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 200;

/// The kinds of events the bus can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Execution moved `Pending -> Running`.
    ExecutionStarted,
    /// Execution reached `Completed`.
    ExecutionCompleted,
    /// Execution reached `Failed`.
    ExecutionFailed,
    /// Execution reached `Cancelled`.
    ExecutionCancelled,
    /// A node moved to `Running`.
    NodeStarted,
    /// A node reached `Completed`.
    NodeCompleted,
    /// A node reached `Failed`.
    NodeFailed,
    /// A node retried after a recoverable failure.
    NodeRetried,
    /// A node reached `Skipped`.
    NodeSkipped,
    /// A variable was written.
    VariableChanged,
    /// A condition node finished evaluating.
    ConditionEvaluated,
    /// A loop began.
    LoopStarted,
    /// One loop iteration finished.
    LoopIteration,
    /// A loop finished (success, break, or cancellation).
    LoopCompleted,
    /// Progress counters changed.
    ProgressUpdate,
}

/// One emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stamped at emit time if not already set by the caller.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event kind.
    pub kind: EventKind,
    /// Node the event concerns, if any.
    pub node_id: Option<String>,
    /// Node type tag, if any.
    pub node_type: Option<String>,
    /// Node-execution ID, if any.
    pub node_execution_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Operation duration, if applicable.
    pub duration: Option<chrono::Duration>,
}

impl Event {
    /// Build a minimal event, timestamped now.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            kind,
            node_id: None,
            node_type: None,
            node_execution_id: None,
            message: message.into(),
            details: serde_json::Map::new(),
            duration: None,
        }
    }

    /// Attach a node ID.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// A subscription filter. Empty lists mean "any" for that dimension.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event kinds to accept; empty means all kinds.
    pub kinds: Vec<EventKind>,
    /// Node IDs to accept; empty means all nodes.
    pub node_ids: Vec<String>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let node_ok = self.node_ids.is_empty()
            || event
                .node_id
                .as_deref()
                .map(|id| self.node_ids.iter().any(|n| n == id))
                .unwrap_or(false);
        kind_ok && node_ok
    }
}

struct Subscriber {
    sender: mpsc::Sender<Event>,
    filter: Option<EventFilter>,
    dropped: Arc<AtomicU64>,
}

/// A live subscription handle: the receiving half of a subscriber's channel,
/// plus bookkeeping to unsubscribe and inspect drop counts.
pub struct Subscription {
    id: u64,
    /// Receives events matching this subscription's filter, in emit order.
    pub receiver: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Count of events dropped for this subscriber due to a full buffer.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Per-execution pub/sub bus.
pub struct EventMonitor {
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
    capacity: usize,
    progress: RwLock<Option<Weak<ProgressTracker>>>,
    context: RwLock<Option<Weak<ExecutionContext>>>,
}

impl EventMonitor {
    /// A bus with the default 200-event subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// A bus with a caller-chosen subscriber capacity (see
    /// [`crate::engine::EngineConfig`]).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            capacity,
            progress: RwLock::new(None),
            context: RwLock::new(None),
        }
    }

    /// Attach this bus to a live execution's progress tracker and variable
    /// context, by weak reference. Lets a subscriber read current progress
    /// or variables without waiting for the next matching event; readers get
    /// `None` once the execution (and its `Arc`s) are gone.
    ///
    /// `Scheduler::run` does not call this itself — it owns its
    /// `ProgressTracker` and `ExecutionContext` directly rather than behind
    /// an `Arc`. Callers who want live reads wrap their own `Arc`s around
    /// those values and attach them before starting the run.
    pub async fn attach(&self, progress: Arc<ProgressTracker>, context: Arc<ExecutionContext>) {
        *self.progress.write().await = Some(Arc::downgrade(&progress));
        *self.context.write().await = Some(Arc::downgrade(&context));
    }

    /// A point-in-time read of the attached execution's progress, or `None`
    /// if nothing is attached or the tracker has been dropped.
    pub async fn get_progress(&self) -> Option<Progress> {
        let weak = self.progress.read().await.clone()?;
        weak.upgrade().map(|tracker| tracker.get_progress())
    }

    /// A point-in-time read of the attached execution's variables, or `None`
    /// if nothing is attached or the context has been dropped.
    pub async fn get_variable_snapshot(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let weak = self.context.read().await.clone()?;
        let context = weak.upgrade()?;
        Some(context.create_snapshot().await)
    }

    /// Subscribe to every event.
    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_filtered(None).await
    }

    /// Subscribe to events matching `filter`.
    pub async fn subscribe_filtered(&self, filter: Option<EventFilter>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dropped = Arc::new(AtomicU64::new(0));
        let subscriber = Subscriber {
            sender: tx,
            filter,
            dropped: dropped.clone(),
        };
        self.subscribers.write().await.push((id, subscriber));
        Subscription {
            id,
            receiver: rx,
            dropped,
        }
    }

    /// Close a subscription. Future emits to it are silently discarded;
    /// emits already in flight before this call still land.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|(id, _)| *id != subscription.id);
    }

    /// Emit an event to every matching subscriber. Never blocks: a full
    /// subscriber buffer drops the event for that subscriber only.
    pub async fn emit(&self, event: Event) {
        let subs = self.subscribers.read().await;
        for (_, subscriber) in subs.iter() {
            let accepted = subscriber
                .filter
                .as_ref()
                .map(|f| f.matches(&event))
                .unwrap_or(true);
            if !accepted {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.sender.try_send(event.clone()) {
                subscriber.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("event subscriber buffer full, dropping event");
            }
            // A Closed error means the subscriber already unsubscribed;
            // discarded silently, matching §4.6.
        }
    }
}

impl Default for EventMonitor {
    fn default() -> Self {
        Self::new()
    }
}
