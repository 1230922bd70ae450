//! Top-level supervisor: owns the team leads, enforces the concurrency
//! ceiling, aggregates status, and offers lifecycle commands.
//!
//! Crashes are contained level by level -- a stage failure never crashes
//! its lead, a lead crash never crashes the orchestrator. The one
//! exception is checkpoint I/O failure, which is fatal by design: the
//! engine cannot proceed without durability, so it shuts down cleanly and
//! leaves the last good checkpoint on disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use foreman_state::{StateError, StateHandle};

use crate::agents::AgentRuntime;
use crate::blocker::BlockerRegistry;
use crate::lead::{TaskResult, TaskSpec, TeamLead, TeamLeadConfig};
use crate::status::{BatchCounters, StatusBus, StatusMessage, StatusReporter, WorkerState};

/// Orchestrator knobs.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Maximum number of team leads running concurrently.
    pub max_concurrent_leads: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_leads: 4,
        }
    }
}

/// Shared ingredients for building team leads, used by the recovery
/// constructor.
#[derive(Clone)]
pub struct LeadContext {
    /// Per-service sandboxes are created under this directory.
    pub sandbox_root: std::path::PathBuf,
    /// Project-conventions document handed to write-capable stages.
    pub conventions: String,
    /// Business specification handed only to QA.
    pub business_spec: String,
    pub runtime: Arc<dyn AgentRuntime>,
    pub blockers: Option<Arc<BlockerRegistry>>,
    pub lead_config: TeamLeadConfig,
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceStatus {
    pub current_task: String,
    pub paused: bool,
    pub completed: usize,
    pub total: usize,
    pub cancelled: bool,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub total_tasks: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub services: BTreeMap<String, ServiceStatus>,
}

/// Supervises all team leads for one project's execution phase.
pub struct Orchestrator {
    project_id: String,
    leads: BTreeMap<String, Arc<TeamLead>>,
    handles: Mutex<Vec<(String, JoinHandle<Vec<TaskResult>>)>>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    reporter: Arc<StatusReporter>,
}

impl Orchestrator {
    pub fn new(
        project_id: impl Into<String>,
        config: OrchestratorConfig,
        bus: Arc<dyn StatusBus>,
    ) -> Self {
        let project_id = project_id.into();
        Self {
            reporter: Arc::new(StatusReporter::new(project_id.clone(), bus)),
            project_id,
            leads: BTreeMap::new(),
            handles: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_leads.max(1))),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Register a lead before `start`. Bumps the total and queued counters
    /// by the lead's task count.
    pub fn add_team_lead(&mut self, lead: TeamLead) {
        lead.set_reporter(Arc::clone(&self.reporter));
        let count = lead.task_count();
        self.reporter.seed(|c| {
            c.total_tasks += count;
            c.queued += count;
        });
        self.leads
            .insert(lead.service_name().to_string(), Arc::new(lead));
    }

    /// Spawn one supervised runner per registered lead, then emit an
    /// initial batch update.
    pub async fn start(&self) {
        info!(
            project_id = %self.project_id,
            services = self.leads.len(),
            "starting orchestrator"
        );

        let all_leads: Arc<Vec<Arc<TeamLead>>> =
            Arc::new(self.leads.values().cloned().collect());

        {
            let mut handles = self.handles.lock().expect("handles lock poisoned");
            for (name, lead) in &self.leads {
                let handle = tokio::spawn(run_lead(
                    name.clone(),
                    Arc::clone(lead),
                    Arc::clone(&self.semaphore),
                    Arc::clone(&self.shutdown),
                    Arc::clone(&self.reporter),
                    Arc::clone(&all_leads),
                ));
                handles.push((name.clone(), handle));
            }
        }

        self.reporter.broadcast_batch().await;
    }

    /// Await every runner. Returns results keyed by service name; a
    /// crashed or cancelled runner contributes an empty list.
    pub async fn wait(&self) -> HashMap<String, Vec<TaskResult>> {
        let handles: Vec<(String, JoinHandle<Vec<TaskResult>>)> =
            std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));

        let mut results = HashMap::new();
        for (name, handle) in handles {
            let service_results = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    error!(service = %name, error = %e, "lead runner task failed");
                    Vec::new()
                }
            };
            results.insert(name, service_results);
        }
        results
    }

    // -- Lifecycle commands -------------------------------------------------

    pub fn pause_all(&self) {
        for lead in self.leads.values() {
            lead.pause();
        }
        info!(project_id = %self.project_id, "all team leads paused");
    }

    pub fn resume_all(&self) {
        for lead in self.leads.values() {
            lead.resume();
        }
        info!(project_id = %self.project_id, "all team leads resumed");
    }

    /// Returns whether the service name matched a lead.
    pub fn pause_service(&self, service_name: &str) -> bool {
        match self.leads.get(service_name) {
            Some(lead) => {
                lead.pause();
                true
            }
            None => false,
        }
    }

    pub fn resume_service(&self, service_name: &str) -> bool {
        match self.leads.get(service_name) {
            Some(lead) => {
                lead.resume();
                true
            }
            None => false,
        }
    }

    /// Cancel every lead and abort their runners. Running stages are
    /// opaque external calls and are left to finish on their own; the next
    /// startup rediscovers their tasks as in-progress and requeues them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for lead in self.leads.values() {
            lead.cancel();
        }
        for (_, handle) in self.handles.lock().expect("handles lock poisoned").iter() {
            handle.abort();
        }
        info!(project_id = %self.project_id, "orchestrator shut down");
    }

    /// Point-in-time status snapshot.
    pub fn get_status(&self) -> StatusSnapshot {
        let counters = self.reporter.counters();
        let services = self
            .leads
            .iter()
            .map(|(name, lead)| {
                (
                    name.clone(),
                    ServiceStatus {
                        current_task: lead.current_task(),
                        paused: lead.is_paused(),
                        completed: lead.completed_len(),
                        total: lead.task_count(),
                        cancelled: lead.is_cancelled(),
                    },
                )
            })
            .collect();
        StatusSnapshot {
            total_tasks: counters.total_tasks,
            queued: counters.queued,
            running: counters.running,
            succeeded: counters.succeeded,
            failed: counters.failed,
            blocked: counters.blocked,
            services,
        }
    }

    /// Number of registered leads.
    pub fn lead_count(&self) -> usize {
        self.leads.len()
    }

    /// Current batch counters (tests and control surfaces).
    pub fn counters(&self) -> BatchCounters {
        self.reporter.counters()
    }

    // -- Recovery constructor -----------------------------------------------

    /// Rebuild an orchestrator from a recovered execution state.
    ///
    /// Builds a lead only for services that still have pending tasks;
    /// already-succeeded tasks are skipped entirely. Counters start from
    /// the checkpoint so observers see accurate totals immediately.
    pub async fn from_execution_state(
        state: &StateHandle,
        ctx: &LeadContext,
        config: OrchestratorConfig,
        bus: Arc<dyn StatusBus>,
    ) -> Self {
        let snapshot = state.snapshot().await;
        let mut orch = Self::new(snapshot.project_id.clone(), config, bus);
        orch.reporter.seed(|c| c.succeeded = snapshot.succeeded);

        for name in snapshot.services.keys() {
            let pending = snapshot.pending_task_ids(name);
            if pending.is_empty() {
                continue;
            }

            // Descriptions and test commands are not checkpointed; the
            // recovered specs carry the persisted title only.
            let tasks: Vec<TaskSpec> = pending
                .iter()
                .filter_map(|tid| snapshot.tasks.get(tid))
                .map(|rec| TaskSpec::new(rec.task_id.clone(), rec.title.clone()))
                .collect();

            let mut lead = TeamLead::new(
                snapshot.project_id.clone(),
                name.clone(),
                ctx.sandbox_root.join(name),
                ctx.conventions.clone(),
                ctx.business_spec.clone(),
                tasks,
                ctx.lead_config,
                Arc::clone(&ctx.runtime),
            )
            .with_state(state.clone());
            if let Some(blockers) = &ctx.blockers {
                lead = lead.with_blockers(Arc::clone(blockers));
            }
            orch.add_team_lead(lead);
        }

        // add_team_lead accounted for pending tasks; fold in the terminal
        // ones so total = succeeded + failed + queued.
        orch.reporter
            .seed(|c| c.total_tasks += snapshot.succeeded + snapshot.failed);

        let counters = orch.reporter.counters();
        info!(
            project_id = %snapshot.project_id,
            total = counters.total_tasks,
            succeeded = counters.succeeded,
            queued = counters.queued,
            "rebuilt orchestrator from checkpoint"
        );
        orch
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_id", &self.project_id)
            .field("leads", &self.leads.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run one lead under the concurrency semaphore, translating its results
/// into counter updates and per-task observer messages.
async fn run_lead(
    name: String,
    lead: Arc<TeamLead>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    reporter: Arc<StatusReporter>,
    all_leads: Arc<Vec<Arc<TeamLead>>>,
) -> Vec<TaskResult> {
    let permit = match Arc::clone(&semaphore).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Vec::new(),
    };
    if shutdown.load(Ordering::SeqCst) {
        return Vec::new();
    }

    let task_count = lead.task_count();
    info!(service = %name, tasks = task_count, "team lead starting");
    reporter
        .apply(|c| {
            c.queued = c.queued.saturating_sub(task_count);
            c.running += task_count;
        })
        .await;

    // Run the lead in its own task so a panic is contained here instead of
    // tearing down this supervisor.
    let runner = tokio::spawn({
        let lead = Arc::clone(&lead);
        async move { lead.run().await }
    });
    let outcome = match runner.await {
        Ok(result) => result,
        Err(join_err) => Err(anyhow::anyhow!("team lead panicked: {join_err}")),
    };
    drop(permit);

    match outcome {
        Ok(results) => {
            for result in &results {
                reporter
                    .worker_status(StatusMessage::WorkerStatus {
                        task_id: result.task_id.clone(),
                        task_title: result.task_title.clone(),
                        service_name: name.clone(),
                        worker_id: name.clone(),
                        status: if result.success {
                            WorkerState::Succeeded
                        } else {
                            WorkerState::Failed
                        },
                        pr_url: non_empty(&result.artifact_url),
                        error: non_empty(&result.error),
                        progress: String::new(),
                    })
                    .await;
                reporter
                    .apply(|c| {
                        if result.success {
                            c.succeeded += 1;
                        } else {
                            c.failed += 1;
                        }
                        c.running = c.running.saturating_sub(1);
                    })
                    .await;
            }
            // Cancelled leads exit early; their unattempted tasks were
            // never observed as running again.
            let unattempted = task_count.saturating_sub(results.len());
            if unattempted > 0 {
                reporter
                    .apply(|c| {
                        c.running = c.running.saturating_sub(unattempted);
                        c.queued += unattempted;
                    })
                    .await;
            }
            info!(service = %name, results = results.len(), "team lead finished");
            results
        }
        Err(e) => {
            error!(
                service = %name,
                error = %format!("{e:#}"),
                "team lead crashed"
            );

            // Tasks the lead finished before crashing were checkpointed and
            // belong in the counters; the rest count as failed.
            let completed = lead.completed_results();
            let remaining = task_count.saturating_sub(completed.len());
            reporter
                .apply(|c| {
                    for result in &completed {
                        if result.success {
                            c.succeeded += 1;
                        } else {
                            c.failed += 1;
                        }
                    }
                    c.failed += remaining;
                    c.running = c.running.saturating_sub(task_count);
                })
                .await;

            // Losing durability is the one crash that must not be contained.
            if e.downcast_ref::<StateError>().is_some() {
                error!(
                    service = %name,
                    "checkpoint failure is fatal, shutting down all leads"
                );
                shutdown.store(true, Ordering::SeqCst);
                for lead in all_leads.iter() {
                    lead.cancel();
                }
            }
            Vec::new()
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentInvocation, AgentOutput};
    use crate::status::NoopStatusBus;
    use async_trait::async_trait;
    use foreman_state::{CheckpointStore, ExecutionState, TaskRecord};

    struct AlwaysOk;

    #[async_trait]
    impl crate::agents::AgentRuntime for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }

        async fn run(&self, _invocation: &AgentInvocation) -> anyhow::Result<AgentOutput> {
            Ok(AgentOutput {
                text: "ok".to_string(),
            })
        }
    }

    fn lead(service: &str, tasks: Vec<TaskSpec>) -> TeamLead {
        TeamLead::new(
            "proj",
            service,
            format!("/tmp/sandbox/{service}"),
            "",
            "",
            tasks,
            TeamLeadConfig::default(),
            Arc::new(AlwaysOk),
        )
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new("proj", OrchestratorConfig::default(), Arc::new(NoopStatusBus))
    }

    #[test]
    fn add_team_lead_bumps_counters() {
        let mut orch = orchestrator();
        orch.add_team_lead(lead(
            "auth",
            vec![TaskSpec::new("t1", "A"), TaskSpec::new("t2", "B")],
        ));
        let counters = orch.counters();
        assert_eq!(counters.total_tasks, 2);
        assert_eq!(counters.queued, 2);
        assert_eq!(orch.lead_count(), 1);
    }

    #[test]
    fn pause_and_resume_forward_to_named_lead() {
        let mut orch = orchestrator();
        orch.add_team_lead(lead("auth", vec![TaskSpec::new("t1", "A")]));

        assert!(orch.pause_service("auth"));
        assert!(orch.get_status().services["auth"].paused);
        assert!(orch.resume_service("auth"));
        assert!(!orch.get_status().services["auth"].paused);
        assert!(!orch.pause_service("ghost"));
        assert!(!orch.resume_service("ghost"));
    }

    #[test]
    fn pause_all_touches_every_lead() {
        let mut orch = orchestrator();
        orch.add_team_lead(lead("auth", vec![TaskSpec::new("t1", "A")]));
        orch.add_team_lead(lead("api", vec![TaskSpec::new("t2", "B")]));

        orch.pause_all();
        let status = orch.get_status();
        assert!(status.services.values().all(|s| s.paused));
        orch.resume_all();
        let status = orch.get_status();
        assert!(status.services.values().all(|s| !s.paused));
    }

    #[tokio::test]
    async fn wait_without_start_is_empty() {
        let orch = orchestrator();
        assert!(orch.wait().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_every_lead() {
        let mut orch = orchestrator();
        orch.add_team_lead(lead("auth", vec![TaskSpec::new("t1", "A")]));
        orch.add_team_lead(lead("api", vec![TaskSpec::new("t2", "B")]));

        orch.shutdown();
        let status = orch.get_status();
        assert!(status.services.values().all(|s| s.cancelled));
    }

    #[tokio::test]
    async fn from_execution_state_skips_complete_services() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = ExecutionState::new("proj");
        state.add_task(TaskRecord::new("t1", "Done already", "auth"));
        state.task_started("t1");
        state.task_completed("t1", true, "", "", vec![]);
        let handle = StateHandle::new(state, store);

        let ctx = LeadContext {
            sandbox_root: dir.path().to_path_buf(),
            conventions: String::new(),
            business_spec: String::new(),
            runtime: Arc::new(AlwaysOk),
            blockers: None,
            lead_config: TeamLeadConfig::default(),
        };
        let orch = Orchestrator::from_execution_state(
            &handle,
            &ctx,
            OrchestratorConfig::default(),
            Arc::new(NoopStatusBus),
        )
        .await;

        assert_eq!(orch.lead_count(), 0);
        let counters = orch.counters();
        assert_eq!(counters.queued, 0);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.total_tasks, 1);
    }

    #[tokio::test]
    async fn from_execution_state_builds_leads_for_pending_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = ExecutionState::new("proj");
        state.add_task(TaskRecord::new("t1", "Done", "auth"));
        state.add_task(TaskRecord::new("t2", "Todo", "auth"));
        state.add_task(TaskRecord::new("t3", "Todo too", "api"));
        state.task_started("t1");
        state.task_completed("t1", true, "", "", vec![]);
        let handle = StateHandle::new(state, store);

        let ctx = LeadContext {
            sandbox_root: dir.path().to_path_buf(),
            conventions: String::new(),
            business_spec: String::new(),
            runtime: Arc::new(AlwaysOk),
            blockers: None,
            lead_config: TeamLeadConfig::default(),
        };
        let orch = Orchestrator::from_execution_state(
            &handle,
            &ctx,
            OrchestratorConfig::default(),
            Arc::new(NoopStatusBus),
        )
        .await;

        assert_eq!(orch.lead_count(), 2);
        let status = orch.get_status();
        assert_eq!(status.services["auth"].total, 1);
        assert_eq!(status.services["api"].total, 1);
        let counters = orch.counters();
        assert_eq!(counters.total_tasks, 3);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.queued, 2);
    }
}
