//! End-to-end orchestrator scenarios: fan-out across services, crash
//! containment, and clean shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use foreman_core::lead::{TaskSpec, TeamLead, TeamLeadConfig};
use foreman_core::orchestrator::{Orchestrator, OrchestratorConfig};
use foreman_core::status::StatusMessage;
use foreman_state::{CheckpointStore, ExecutionState, StateHandle, TaskRecord, TaskStatus};
use foreman_test_utils::{RecordingBus, ScriptedRuntime, ServiceScript, StageBehavior};

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    _dir: tempfile::TempDir,
    sandbox_root: PathBuf,
    store: CheckpointStore,
    state: StateHandle,
    bus: Arc<RecordingBus>,
}

impl TestHarness {
    /// Build a state with the given `(service, [task ids])` layout.
    fn new(layout: &[(&str, &[&str])]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox_root = dir.path().join("sandboxes");
        let store = CheckpointStore::new(dir.path().join("state"));

        let mut state = ExecutionState::new("proj");
        for (service, task_ids) in layout {
            for tid in *task_ids {
                state.add_task(TaskRecord::new(*tid, format!("Task {tid}"), *service));
            }
        }
        let state = StateHandle::new(state, store.clone());

        Self {
            _dir: dir,
            sandbox_root,
            store,
            state,
            bus: Arc::new(RecordingBus::new()),
        }
    }

    fn lead(
        &self,
        service: &str,
        task_ids: &[&str],
        runtime: Arc<ScriptedRuntime>,
    ) -> TeamLead {
        let tasks = task_ids
            .iter()
            .map(|tid| TaskSpec::new(*tid, format!("Task {tid}")))
            .collect();
        TeamLead::new(
            "proj",
            service,
            self.sandbox_root.join(service),
            "conventions",
            "business spec",
            tasks,
            TeamLeadConfig {
                retry_count: 1,
                max_turns: 5,
            },
            runtime,
        )
        .with_state(self.state.clone())
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            "proj",
            OrchestratorConfig::default(),
            Arc::clone(&self.bus) as Arc<dyn foreman_core::status::StatusBus>,
        )
    }
}

fn batch_field(msg: &StatusMessage) -> Option<(usize, usize, usize)> {
    match msg {
        StatusMessage::WorkerBatch {
            succeeded,
            failed,
            blocked,
            ..
        } => Some((*succeeded, *failed, *blocked)),
        _ => None,
    }
}

// ===========================================================================
// S1 -- happy path, two services
// ===========================================================================

#[tokio::test]
async fn happy_path_two_services() {
    let harness = TestHarness::new(&[("auth", &["t1", "t2"]), ("api", &["t3"])]);
    let runtime = Arc::new(ScriptedRuntime::all_succeed());

    let mut orch = harness.orchestrator();
    orch.add_team_lead(harness.lead("auth", &["t1", "t2"], Arc::clone(&runtime)));
    orch.add_team_lead(harness.lead("api", &["t3"], Arc::clone(&runtime)));

    orch.start().await;
    let results = orch.wait().await;

    // All three tasks succeeded.
    let counters = orch.counters();
    assert_eq!(counters.total_tasks, 3);
    assert_eq!(counters.succeeded, 3);
    assert_eq!(counters.failed, 0);
    assert_eq!(counters.queued, 0);
    assert_eq!(counters.running, 0);

    assert_eq!(results["auth"].len(), 2);
    assert_eq!(results["api"].len(), 1);
    assert!(results.values().flatten().all(|r| r.success));

    // The checkpoint on disk shows all tasks succeeded.
    let on_disk = harness.store.load("proj").await.unwrap();
    assert_eq!(on_disk.succeeded, 3);
    assert!(on_disk
        .tasks
        .values()
        .all(|t| t.status == TaskStatus::Succeeded));
    assert_eq!(on_disk.services["auth"].completed_task_ids, vec!["t1", "t2"]);

    // Observers saw at least three per-task updates and a batch reaching 3.
    assert!(harness.bus.worker_statuses().len() >= 3);
    assert!(harness
        .bus
        .batches()
        .iter()
        .any(|m| batch_field(m) == Some((3, 0, 0))));

    // Within a service, outcomes are observed in task-list order.
    let auth_order: Vec<String> = harness
        .bus
        .worker_statuses()
        .into_iter()
        .filter_map(|m| match m {
            StatusMessage::WorkerStatus {
                task_id,
                service_name,
                ..
            } if service_name == "auth" => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(auth_order, vec!["t1", "t2"]);
}

// ===========================================================================
// S5 -- lead crash is contained
// ===========================================================================

#[tokio::test]
async fn lead_crash_is_contained() {
    let harness = TestHarness::new(&[("auth", &["t1", "t2"]), ("api", &["t3"])]);
    let runtime = Arc::new(
        ScriptedRuntime::all_succeed().with_service(
            "auth",
            ServiceScript {
                code_writer: StageBehavior::Panic,
                unit_tester: StageBehavior::Succeed,
                qa_tester: StageBehavior::Succeed,
            },
        ),
    );

    let mut orch = harness.orchestrator();
    orch.add_team_lead(harness.lead("auth", &["t1", "t2"], Arc::clone(&runtime)));
    orch.add_team_lead(harness.lead("api", &["t3"], Arc::clone(&runtime)));

    orch.start().await;
    let results = orch.wait().await;

    // Both service keys are present; the crashed one is empty, the healthy
    // one is intact.
    assert!(results["auth"].is_empty());
    assert_eq!(results["api"].len(), 1);
    assert!(results["api"][0].success);

    // The crashed lead's tasks count as failed.
    let counters = orch.counters();
    assert_eq!(counters.failed, 2);
    assert_eq!(counters.succeeded, 1);
    assert_eq!(counters.running, 0);
}

// ===========================================================================
// S6 -- shutdown cancels cleanly
// ===========================================================================

#[tokio::test]
async fn shutdown_cancels_cleanly() {
    let harness = TestHarness::new(&[("auth", &["t1"])]);
    let runtime = Arc::new(ScriptedRuntime::new(ServiceScript {
        code_writer: StageBehavior::Hang,
        unit_tester: StageBehavior::Succeed,
        qa_tester: StageBehavior::Succeed,
    }));

    let mut orch = harness.orchestrator();
    orch.add_team_lead(harness.lead("auth", &["t1"], runtime));
    orch.start().await;

    // Let the lead enter its hanging stage, then shut down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.shutdown();

    let results = orch.wait().await;
    assert!(results["auth"].is_empty());
    assert!(orch.get_status().services["auth"].cancelled);

    // Every reload point sees a complete, parseable checkpoint, and the
    // next recovery observes the in-flight task back at pending.
    harness.state.flush().await.unwrap();
    let recovered = foreman_state::recover(&harness.store, "proj", None)
        .await
        .unwrap();
    assert_eq!(recovered.tasks["t1"].status, TaskStatus::Pending);
    assert!(recovered.services["auth"].current_task_id.is_empty());
}

// ===========================================================================
// Boundary behaviors
// ===========================================================================

#[tokio::test]
async fn start_with_no_leads_completes_immediately() {
    let harness = TestHarness::new(&[]);
    let orch = harness.orchestrator();
    orch.start().await;
    let results = orch.wait().await;
    assert!(results.is_empty());
    assert_eq!(orch.counters().total_tasks, 0);
    // The initial batch update still went out.
    assert!(!harness.bus.batches().is_empty());
}

#[tokio::test]
async fn concurrency_is_bounded_by_semaphore() {
    // Four single-task services behind a ceiling of 1 still all finish.
    let harness = TestHarness::new(&[
        ("s1", &["t1"]),
        ("s2", &["t2"]),
        ("s3", &["t3"]),
        ("s4", &["t4"]),
    ]);
    let runtime = Arc::new(ScriptedRuntime::all_succeed());

    let mut orch = Orchestrator::new(
        "proj",
        OrchestratorConfig {
            max_concurrent_leads: 1,
        },
        Arc::clone(&harness.bus) as Arc<dyn foreman_core::status::StatusBus>,
    );
    for (service, tid) in [("s1", "t1"), ("s2", "t2"), ("s3", "t3"), ("s4", "t4")] {
        orch.add_team_lead(harness.lead(service, &[tid], Arc::clone(&runtime)));
    }

    orch.start().await;
    let results = orch.wait().await;
    assert_eq!(results.len(), 4);
    assert_eq!(orch.counters().succeeded, 4);
}
