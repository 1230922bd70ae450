use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted stage output is capped so the checkpoint stays readable.
pub const STAGE_OUTPUT_LIMIT: usize = 2_000;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Whether the task still counts toward the `pending` summary counter.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// The three stages of a task pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    CodeWriter,
    UnitTester,
    QaTester,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CodeWriter => "code_writer",
            Self::UnitTester => "unit_tester",
            Self::QaTester => "qa_tester",
        };
        f.write_str(s)
    }
}

impl FromStr for StageKind {
    type Err = StageKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_writer" => Ok(Self::CodeWriter),
            "unit_tester" => Ok(Self::UnitTester),
            "qa_tester" => Ok(Self::QaTester),
            other => Err(StageKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StageKind`] string.
#[derive(Debug, Clone)]
pub struct StageKindParseError(pub String);

impl fmt::Display for StageKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stage kind: {:?}", self.0)
    }
}

impl std::error::Error for StageKindParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Outcome of a single stage, as persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl StageRecord {
    /// Build a record, truncating output and error to [`STAGE_OUTPUT_LIMIT`].
    pub fn new(
        stage: StageKind,
        success: bool,
        output: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            success,
            output: truncate_chars(&output.into(), STAGE_OUTPUT_LIMIT),
            error: truncate_chars(&error.into(), STAGE_OUTPUT_LIMIT),
        }
    }
}

/// Truncate to at most `limit` characters, on a character boundary.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// A task -- one unit of work within a service. Terminal records persist as
/// the audit log; tasks are never removed from the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub service_name: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// URL of the work product; set only on success.
    #[serde(default)]
    pub artifact_url: String,
    /// Failure description; set only on failure.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stage_results: Vec<StageRecord>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            service_name: normalize_service_name(&service_name.into()),
            status: TaskStatus::Pending,
            artifact_url: String::new(),
            error: String::new(),
            stage_results: Vec::new(),
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A blocker -- a durable wait-point for a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerRecord {
    pub blocker_id: String,
    pub service_name: String,
    pub question: String,
    /// External ticket id; empty when the ticket system is not configured.
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub ticket_url: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub answer: String,
}

/// A service -- a named, ordered unit of work executed serially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_name: String,
    /// The serial execution order.
    #[serde(default)]
    pub task_ids: Vec<String>,
    /// Append-only subset of `task_ids`, in completion order.
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
    /// Empty when the service is idle.
    #[serde(default)]
    pub current_task_id: String,
    #[serde(default)]
    pub paused: bool,
}

impl ServiceRecord {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: normalize_service_name(&service_name.into()),
            task_ids: Vec::new(),
            completed_task_ids: Vec::new(),
            current_task_id: String::new(),
            paused: false,
        }
    }
}

/// Service names are case-folded, trimmed identifiers.
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Top-level aggregate: everything the engine knows about one project's
/// execution, serializable as a single JSON document.
///
/// The summary counters are derived; they are recomputed from the task map
/// on every mutation and on load, never trusted from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub project_id: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
    #[serde(default)]
    pub blockers: BTreeMap<String, BlockerRecord>,
    #[serde(default)]
    pub total_tasks: usize,
    #[serde(default)]
    pub succeeded: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub pending: usize,
}

impl ExecutionState {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            started_at: Some(Utc::now()),
            updated_at: None,
            tasks: BTreeMap::new(),
            services: BTreeMap::new(),
            blockers: BTreeMap::new(),
            total_tasks: 0,
            succeeded: 0,
            failed: 0,
            pending: 0,
        }
    }

    /// Insert a task, registering it in its service's execution order.
    /// The service record is created on first use.
    pub fn add_task(&mut self, task: TaskRecord) {
        let service = self
            .services
            .entry(task.service_name.clone())
            .or_insert_with(|| ServiceRecord::new(task.service_name.clone()));
        if !service.task_ids.contains(&task.task_id) {
            service.task_ids.push(task.task_id.clone());
        }
        self.tasks.insert(task.task_id.clone(), task);
        self.recount();
    }

    // -- Queries ------------------------------------------------------------

    /// Ordered subsequence of a service's task list whose tasks are still
    /// pending or blocked. Tasks currently in progress appear in neither
    /// this list nor `completed_task_ids`.
    pub fn pending_task_ids(&self, service_name: &str) -> Vec<String> {
        let Some(service) = self.services.get(service_name) else {
            return Vec::new();
        };
        service
            .task_ids
            .iter()
            .filter(|tid| {
                self.tasks
                    .get(*tid)
                    .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
            })
            .cloned()
            .collect()
    }

    /// Tasks that were in progress when the process died. Recovery only.
    pub fn tasks_needing_requeue(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::InProgress)
            .map(|(tid, _)| tid.clone())
            .collect()
    }

    // -- Checkpoint mutators ------------------------------------------------
    //
    // These mirror the engine's transitions; durability (the flush) is the
    // caller's concern -- see `StateHandle`.

    /// Mark a task in progress: stamp `started_at`, bump `attempts`, point
    /// the owning service's `current_task_id` at it. In-memory only.
    pub fn task_started(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        task.attempts += 1;
        let service_name = task.service_name.clone();
        if let Some(service) = self.services.get_mut(&service_name) {
            service.current_task_id = task_id.to_string();
        }
        self.recount();
    }

    /// Mark a task succeeded or failed and update the owning service.
    pub fn task_completed(
        &mut self,
        task_id: &str,
        success: bool,
        artifact_url: &str,
        error: &str,
        stage_results: Vec<StageRecord>,
    ) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.status = if success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        task.completed_at = Some(Utc::now());
        task.artifact_url = artifact_url.to_string();
        task.error = error.to_string();
        if !stage_results.is_empty() {
            task.stage_results = stage_results;
        }

        let service_name = task.service_name.clone();
        if let Some(service) = self.services.get_mut(&service_name) {
            if success && !service.completed_task_ids.contains(&task_id.to_string()) {
                service.completed_task_ids.push(task_id.to_string());
            }
            service.current_task_id.clear();
        }
        self.recount();
    }

    /// Mark a task blocked while it awaits a human decision.
    pub fn task_blocked(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Blocked;
        }
        self.recount();
    }

    /// Return a blocked task to in-progress once its answer arrived.
    /// Does not bump `attempts`; the task never stopped.
    pub fn task_resumed(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Blocked {
                task.status = TaskStatus::InProgress;
            }
        }
        self.recount();
    }

    /// Record a new blocker.
    pub fn blocker_created(&mut self, record: BlockerRecord) {
        self.blockers.insert(record.blocker_id.clone(), record);
    }

    /// Mark a blocker resolved with its answer.
    pub fn blocker_resolved(&mut self, blocker_id: &str, answer: &str) {
        if let Some(blocker) = self.blockers.get_mut(blocker_id) {
            blocker.resolved = true;
            blocker.answer = answer.to_string();
        }
    }

    /// Recompute the summary counters from task statuses.
    pub fn recount(&mut self) {
        self.total_tasks = self.tasks.len();
        self.succeeded = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count();
        self.failed = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        self.pending = self.tasks.values().filter(|t| t.status.is_open()).count();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
