//! Team lead -- serial executor for one service's task list.
//!
//! Drives each task through the three-stage pipeline, honors
//! pause/resume/cancel, retries failed tasks, and checkpoints every
//! outcome. Stage failures never escape a task; task failures never stop
//! the service.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_state::{StageKind, StageRecord, StateHandle};

use crate::agents::{
    blocker_question, run_code_writer, run_qa_tester, run_unit_tester, AgentRuntime,
    SubAgentResult,
};
use crate::blocker::BlockerRegistry;
use crate::status::StatusReporter;

/// One task as handed to a lead by the plan loader or the recovery
/// constructor. Descriptions are not checkpointed, so recovered specs carry
/// an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub description: String,
    pub test_commands: Vec<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            test_commands: Vec::new(),
        }
    }
}

/// Outcome of one task: the per-stage results plus the rollup.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub task_id: String,
    pub task_title: String,
    pub success: bool,
    pub code_writer: Option<SubAgentResult>,
    pub unit_tester: Option<SubAgentResult>,
    pub qa_tester: Option<SubAgentResult>,
    /// Work-product URL; empty unless a later stage published one.
    pub artifact_url: String,
    pub error: String,
}

impl TaskResult {
    /// The persisted per-stage records, truncated for the checkpoint.
    pub fn stage_records(&self) -> Vec<StageRecord> {
        let mut records = Vec::new();
        let stages = [
            (StageKind::CodeWriter, &self.code_writer),
            (StageKind::UnitTester, &self.unit_tester),
            (StageKind::QaTester, &self.qa_tester),
        ];
        for (kind, result) in stages {
            if let Some(r) = result {
                records.push(StageRecord::new(kind, r.success, &r.output, &r.error));
            }
        }
        records
    }
}

/// Knobs for one lead.
#[derive(Debug, Clone, Copy)]
pub struct TeamLeadConfig {
    /// Retries after a failed first attempt (so `1 + retry_count` starts
    /// at most).
    pub retry_count: u32,
    /// Per-stage turn budget.
    pub max_turns: u32,
}

impl Default for TeamLeadConfig {
    fn default() -> Self {
        Self {
            retry_count: 1,
            max_turns: 50,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    completed: Vec<TaskResult>,
    current_task: String,
    paused: bool,
    cancelled: bool,
}

/// Executes one service's tasks serially in the service's sandbox.
pub struct TeamLead {
    project_id: String,
    service_name: String,
    sandbox: PathBuf,
    conventions: String,
    business_spec: String,
    tasks: Vec<TaskSpec>,
    config: TeamLeadConfig,
    runtime: Arc<dyn AgentRuntime>,
    blockers: Option<Arc<BlockerRegistry>>,
    state: Option<StateHandle>,
    progress: Mutex<Progress>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    reporter: Mutex<Option<Arc<StatusReporter>>>,
}

impl TeamLead {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        service_name: impl Into<String>,
        sandbox: impl Into<PathBuf>,
        conventions: impl Into<String>,
        business_spec: impl Into<String>,
        tasks: Vec<TaskSpec>,
        config: TeamLeadConfig,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        // Gate is open until someone pauses.
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            project_id: project_id.into(),
            service_name: service_name.into(),
            sandbox: sandbox.into(),
            conventions: conventions.into(),
            business_spec: business_spec.into(),
            tasks,
            config,
            runtime,
            blockers: None,
            state: None,
            progress: Mutex::new(Progress::default()),
            pause_tx,
            pause_rx,
            cancel: CancellationToken::new(),
            reporter: Mutex::new(None),
        }
    }

    /// Attach the blocker registry so stages can raise wait-points.
    pub fn with_blockers(mut self, blockers: Arc<BlockerRegistry>) -> Self {
        self.blockers = Some(blockers);
        self
    }

    /// Attach the execution state for checkpointing.
    pub fn with_state(mut self, state: StateHandle) -> Self {
        self.state = Some(state);
        self
    }

    // -- Introspection ------------------------------------------------------

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn current_task(&self) -> String {
        self.lock_progress().current_task.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock_progress().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_progress().cancelled
    }

    pub fn completed_results(&self) -> Vec<TaskResult> {
        self.lock_progress().completed.clone()
    }

    pub fn completed_len(&self) -> usize {
        self.lock_progress().completed.len()
    }

    // -- Control ------------------------------------------------------------

    /// Close the pause gate. The loop blocks before its next task.
    pub fn pause(&self) {
        self.lock_progress().paused = true;
        let _ = self.pause_tx.send(true);
        info!(service = %self.service_name, "team lead paused");
    }

    /// Reopen the pause gate. A no-op when not paused.
    pub fn resume(&self) {
        self.lock_progress().paused = false;
        let _ = self.pause_tx.send(false);
        info!(service = %self.service_name, "team lead resumed");
    }

    /// Stop the loop at the next gate wake or stage completion. A running
    /// stage is an opaque external call and is not killed.
    pub fn cancel(&self) {
        self.lock_progress().cancelled = true;
        self.cancel.cancel();
        info!(service = %self.service_name, "team lead cancelled");
    }

    /// Used by the orchestrator so blocker and retry transitions land in
    /// the shared counter stream.
    pub fn set_reporter(&self, reporter: Arc<StatusReporter>) {
        *self.reporter.lock().expect("reporter lock poisoned") = Some(reporter);
    }

    // -- Main loop ----------------------------------------------------------

    /// Process all tasks in order. Returns a result per attempted task.
    ///
    /// Errors escape only for checkpoint I/O failures, which are fatal to
    /// the whole engine.
    pub async fn run(&self) -> Result<Vec<TaskResult>> {
        let mut results: Vec<TaskResult> = Vec::new();

        for task in &self.tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            self.wait_gate().await;
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_current(&task.title);
            if let Some(state) = &self.state {
                state.task_started(&task.id).await;
            }
            info!(
                service = %self.service_name,
                task_id = %task.id,
                title = %task.title,
                "starting task"
            );

            let mut result = self.execute_task(task).await?;
            results.push(result.clone());
            self.lock_progress().completed.push(result.clone());

            if !result.success {
                for attempt in 1..=self.config.retry_count {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!(
                        service = %self.service_name,
                        task_id = %task.id,
                        attempt,
                        retry_count = self.config.retry_count,
                        "retrying task"
                    );
                    if let Some(reporter) = self.reporter() {
                        reporter
                            .task_retrying(&task.id, &task.title, &self.service_name)
                            .await;
                    }
                    if let Some(state) = &self.state {
                        state.task_started(&task.id).await;
                    }
                    let retry = self.execute_task(task).await?;
                    if retry.success {
                        // The retry replaces the failed result.
                        if let Some(last) = results.last_mut() {
                            *last = retry.clone();
                        }
                        if let Some(last) = self.lock_progress().completed.last_mut() {
                            *last = retry.clone();
                        }
                        result = retry;
                        break;
                    }
                }
            }

            if let Some(state) = &self.state {
                state
                    .task_completed(
                        &task.id,
                        result.success,
                        &result.artifact_url,
                        &result.error,
                        result.stage_records(),
                    )
                    .await?;
            }
        }

        self.set_current("");
        Ok(results)
    }

    /// Run the full pipeline for one task: implement, unit-test, QA.
    /// Overall success equals the QATester's verdict.
    async fn execute_task(&self, task: &TaskSpec) -> Result<TaskResult> {
        let task_prompt = format!("## Task: {}\n\n{}", task.title, task.description);

        let code = self
            .run_stage(StageKind::CodeWriter, task, &task_prompt)
            .await?;
        if !code.success {
            let error = format!("CodeWriter failed: {}", code.error);
            return Ok(TaskResult {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                success: false,
                code_writer: Some(code),
                error,
                ..TaskResult::default()
            });
        }

        let test_prompt = format!(
            "## Task: {}\n\nWrite unit tests for the implementation.\n\n{}",
            task.title, task.description
        );
        let unit = self
            .run_stage(StageKind::UnitTester, task, &test_prompt)
            .await?;
        if !unit.success {
            let error = format!("UnitTester failed: {}", unit.error);
            return Ok(TaskResult {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                success: false,
                code_writer: Some(code),
                unit_tester: Some(unit),
                error,
                ..TaskResult::default()
            });
        }

        let qa = self.run_stage(StageKind::QaTester, task, "").await?;
        let success = qa.success;
        let error = if success {
            String::new()
        } else {
            format!("QATester failed: {}", qa.error)
        };

        Ok(TaskResult {
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            success,
            code_writer: Some(code),
            unit_tester: Some(unit),
            qa_tester: Some(qa),
            artifact_url: String::new(),
            error,
        })
    }

    /// Run one stage, handling blockers it raises: park the task as
    /// blocked, await the answer, then restart the stage with the decision
    /// appended to its context. The sandbox is shared across restarts and
    /// attempts so later runs build on prior progress.
    async fn run_stage(
        &self,
        kind: StageKind,
        task: &TaskSpec,
        prompt: &str,
    ) -> Result<SubAgentResult> {
        let mut decision_context = String::new();

        loop {
            let result = match kind {
                StageKind::CodeWriter => {
                    let full = format!("{prompt}{decision_context}");
                    run_code_writer(
                        self.runtime.as_ref(),
                        &self.sandbox,
                        &full,
                        &self.conventions,
                        self.config.max_turns,
                    )
                    .await
                }
                StageKind::UnitTester => {
                    let full = format!("{prompt}{decision_context}");
                    run_unit_tester(
                        self.runtime.as_ref(),
                        &self.sandbox,
                        &full,
                        &self.conventions,
                        self.config.max_turns,
                    )
                    .await
                }
                StageKind::QaTester => {
                    let spec = format!("{}{decision_context}", self.business_spec);
                    run_qa_tester(
                        self.runtime.as_ref(),
                        &self.sandbox,
                        &spec,
                        &task.test_commands,
                        self.config.max_turns,
                    )
                    .await
                }
            };

            if !result.success {
                return Ok(result);
            }
            let Some(question) = blocker_question(&result.output) else {
                return Ok(result);
            };
            let question = question.to_string();

            let Some(registry) = &self.blockers else {
                warn!(
                    service = %self.service_name,
                    task_id = %task.id,
                    question = %question,
                    "stage raised a blocker but no registry is attached"
                );
                return Ok(result);
            };

            if let Some(state) = &self.state {
                state.task_blocked(&task.id).await?;
            }
            if let Some(reporter) = self.reporter() {
                reporter.blocker_raised().await;
            }

            let handle = registry
                .create(
                    &self.project_id,
                    &self.service_name,
                    &question,
                    self.state.as_ref(),
                )
                .await?;

            info!(
                service = %self.service_name,
                task_id = %task.id,
                blocker_id = %handle.blocker_id,
                "stage blocked, awaiting human decision"
            );

            let answer = tokio::select! {
                answer = handle.await_answer() => answer,
                _ = self.cancel.cancelled() => {
                    if let Some(reporter) = self.reporter() {
                        reporter.blocker_cleared().await;
                    }
                    return Ok(SubAgentResult {
                        success: false,
                        output: result.output,
                        error: "cancelled while awaiting a human decision".to_string(),
                    });
                }
            };

            registry.cleanup(&handle.blocker_id);
            if let Some(state) = &self.state {
                state.task_resumed(&task.id).await;
            }
            if let Some(reporter) = self.reporter() {
                reporter.blocker_cleared().await;
            }

            decision_context = format!(
                "\n\n## Human decision\nQuestion: {question}\nAnswer: {answer}\n"
            );
            // Restart the stage with the decision in context.
        }
    }

    // -- Internals ----------------------------------------------------------

    /// Block while the gate is closed; wake on resume or cancel.
    async fn wait_gate(&self) {
        let mut rx = self.pause_rx.clone();
        loop {
            if !*rx.borrow() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn set_current(&self, title: &str) {
        self.lock_progress().current_task = title.to_string();
    }

    fn reporter(&self) -> Option<Arc<StatusReporter>> {
        self.reporter.lock().expect("reporter lock poisoned").clone()
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().expect("progress lock poisoned")
    }
}

impl std::fmt::Debug for TeamLead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamLead")
            .field("service_name", &self.service_name)
            .field("tasks", &self.tasks.len())
            .field("paused", &self.is_paused())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
