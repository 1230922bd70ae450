//! Outbound status protocol.
//!
//! Three message shapes flow to observers: per-task worker updates, batch
//! counter updates, and blocker notifications. Delivery is at-most-once and
//! best-effort; a failed send is logged and never stalls the engine.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Observer-visible state of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Queued,
    Running,
    PrOpened,
    Succeeded,
    Failed,
    Retrying,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::PrOpened => "pr_opened",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// A message pushed to observers, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    WorkerStatus {
        task_id: String,
        task_title: String,
        service_name: String,
        worker_id: String,
        status: WorkerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        progress: String,
    },
    WorkerBatch {
        total_tasks: usize,
        #[serde(default)]
        queued: usize,
        #[serde(default)]
        running: usize,
        #[serde(default)]
        succeeded: usize,
        #[serde(default)]
        failed: usize,
        #[serde(default)]
        blocked: usize,
    },
    BlockerNotification {
        blocker_id: String,
        service_name: String,
        question: String,
        #[serde(default)]
        linear_issue_url: String,
        #[serde(default)]
        resolved: bool,
    },
}

/// Abstract outbound channel to observers.
///
/// Multiplexing, framing, and transport live outside the engine; the engine
/// only assumes `send` returns whether the message was delivered.
#[async_trait]
pub trait StatusBus: Send + Sync {
    async fn send(&self, observer_key: &str, message: &StatusMessage) -> bool;
}

/// Send a message, logging (but otherwise ignoring) delivery failure.
pub async fn send_best_effort(bus: &dyn StatusBus, observer_key: &str, message: &StatusMessage) {
    if !bus.send(observer_key, message).await {
        debug!(observer_key, "status message not delivered");
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// The batch counters observers see. Mutated only through
/// [`StatusReporter::apply`], which pushes a batch update after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub total_tasks: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl BatchCounters {
    pub fn to_message(self) -> StatusMessage {
        StatusMessage::WorkerBatch {
            total_tasks: self.total_tasks,
            queued: self.queued,
            running: self.running,
            succeeded: self.succeeded,
            failed: self.failed,
            blocked: self.blocked,
        }
    }
}

/// Shared counter state plus the outbound bus.
///
/// The orchestrator owns one reporter and hands it to its team leads so
/// blocker transitions and retries show up in the same counter stream.
pub struct StatusReporter {
    observer_key: String,
    counters: std::sync::Mutex<BatchCounters>,
    bus: std::sync::Arc<dyn StatusBus>,
}

impl StatusReporter {
    pub fn new(observer_key: impl Into<String>, bus: std::sync::Arc<dyn StatusBus>) -> Self {
        Self {
            observer_key: observer_key.into(),
            counters: std::sync::Mutex::new(BatchCounters::default()),
            bus,
        }
    }

    pub fn observer_key(&self) -> &str {
        &self.observer_key
    }

    /// Current counter snapshot.
    pub fn counters(&self) -> BatchCounters {
        *self.counters.lock().expect("counter lock poisoned")
    }

    /// Mutate the counters without notifying observers. Used for initial
    /// seeding before the engine starts.
    pub fn seed(&self, f: impl FnOnce(&mut BatchCounters)) {
        f(&mut self.counters.lock().expect("counter lock poisoned"));
    }

    /// Mutate the counters, then push a batch update. Guarantees at least
    /// one batch message per counter change.
    pub async fn apply(&self, f: impl FnOnce(&mut BatchCounters)) {
        let snapshot = {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            f(&mut counters);
            *counters
        };
        send_best_effort(self.bus.as_ref(), &self.observer_key, &snapshot.to_message()).await;
    }

    /// Push a batch update for the current counters.
    pub async fn broadcast_batch(&self) {
        let snapshot = self.counters();
        send_best_effort(self.bus.as_ref(), &self.observer_key, &snapshot.to_message()).await;
    }

    /// Push a per-task update.
    pub async fn worker_status(&self, message: StatusMessage) {
        send_best_effort(self.bus.as_ref(), &self.observer_key, &message).await;
    }

    /// A stage raised a blocker; the task is waiting on a human.
    pub async fn blocker_raised(&self) {
        self.apply(|c| c.blocked += 1).await;
    }

    /// The blocker was answered; the task is running again.
    pub async fn blocker_cleared(&self) {
        self.apply(|c| c.blocked = c.blocked.saturating_sub(1)).await;
    }

    /// A task is being retried after a failed attempt.
    pub async fn task_retrying(&self, task_id: &str, task_title: &str, service_name: &str) {
        self.worker_status(StatusMessage::WorkerStatus {
            task_id: task_id.to_string(),
            task_title: task_title.to_string(),
            service_name: service_name.to_string(),
            worker_id: service_name.to_string(),
            status: WorkerState::Retrying,
            pr_url: None,
            error: None,
            progress: String::new(),
        })
        .await;
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("observer_key", &self.observer_key)
            .field("counters", &self.counters())
            .finish()
    }
}

/// A bus with no observers. Every send reports non-delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusBus;

#[async_trait]
impl StatusBus for NoopStatusBus {
    async fn send(&self, _observer_key: &str, _message: &StatusMessage) -> bool {
        false
    }
}

/// Fan-out bus backed by a tokio broadcast channel.
///
/// Observer keys are not used for routing here -- every subscriber sees
/// every message; the key travels with the message for callers that filter.
pub struct BroadcastStatusBus {
    tx: tokio::sync::broadcast::Sender<(String, StatusMessage)>,
}

impl BroadcastStatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(String, StatusMessage)> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl StatusBus for BroadcastStatusBus {
    async fn send(&self, observer_key: &str, message: &StatusMessage) -> bool {
        match self.tx.send((observer_key.to_string(), message.clone())) {
            Ok(_) => true,
            Err(e) => {
                // No receivers subscribed; expected during startup.
                warn!(error = %e, "no status observers connected");
                false
            }
        }
    }
}
