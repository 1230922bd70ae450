//! Shared handle over the execution state.
//!
//! The orchestrator owns the state for its lifetime; team leads and the
//! blocker registry hold clones of this handle and mutate only through the
//! checkpoint methods below. Each method takes the lock, applies the
//! transition, and (where the contract requires durability) flushes before
//! returning -- the lock is held across the flush so checkpoints serialize.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::records::{BlockerRecord, ExecutionState, StageRecord};
use crate::store::{CheckpointStore, StateError};

/// Cloneable handle to a project's execution state plus its backing store.
#[derive(Clone)]
pub struct StateHandle {
    project_id: String,
    inner: Arc<Mutex<ExecutionState>>,
    store: CheckpointStore,
}

impl StateHandle {
    pub fn new(state: ExecutionState, store: CheckpointStore) -> Self {
        Self {
            project_id: state.project_id.clone(),
            inner: Arc::new(Mutex::new(state)),
            store,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Point-in-time copy of the state.
    pub async fn snapshot(&self) -> ExecutionState {
        self.inner.lock().await.clone()
    }

    /// Persist the current state without mutating it.
    pub async fn flush(&self) -> Result<(), StateError> {
        let state = self.inner.lock().await;
        self.store.save(&state).await
    }

    pub async fn pending_task_ids(&self, service_name: &str) -> Vec<String> {
        self.inner.lock().await.pending_task_ids(service_name)
    }

    /// In-memory only by contract: a crash between start and completion is
    /// repaired by recovery's requeue pass, not by a durable record.
    pub async fn task_started(&self, task_id: &str) {
        self.inner.lock().await.task_started(task_id);
    }

    /// Record a terminal task outcome and flush.
    pub async fn task_completed(
        &self,
        task_id: &str,
        success: bool,
        artifact_url: &str,
        error: &str,
        stage_results: Vec<StageRecord>,
    ) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.task_completed(task_id, success, artifact_url, error, stage_results);
        self.store.save(&state).await
    }

    /// Mark a task blocked and flush.
    pub async fn task_blocked(&self, task_id: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.task_blocked(task_id);
        self.store.save(&state).await
    }

    /// Return a blocked task to in-progress. In-memory only, mirroring
    /// `task_started`.
    pub async fn task_resumed(&self, task_id: &str) {
        self.inner.lock().await.task_resumed(task_id);
    }

    /// Record a new blocker and flush.
    pub async fn blocker_created(&self, record: BlockerRecord) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.blocker_created(record);
        self.store.save(&state).await
    }

    /// Record a blocker resolution and flush.
    pub async fn blocker_resolved(&self, blocker_id: &str, answer: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.blocker_resolved(blocker_id, answer);
        self.store.save(&state).await
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("project_id", &self.project_id)
            .finish()
    }
}
