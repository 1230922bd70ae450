//! S4: a stage raises a blocker, the task parks as blocked, and an
//! out-of-band ticket comment releases it.

use std::sync::Arc;
use std::time::Duration;

use foreman_core::blocker::BlockerRegistry;
use foreman_core::lead::{TaskSpec, TeamLead, TeamLeadConfig};
use foreman_core::orchestrator::{Orchestrator, OrchestratorConfig};
use foreman_core::status::{StatusBus, StatusMessage};
use foreman_state::{recover, CheckpointStore, ExecutionState, StateHandle, TaskRecord, TaskStatus};
use foreman_test_utils::{RecordingBus, ScriptedRuntime, ServiceScript, StageBehavior, StubTickets};

struct BlockerHarness {
    _dir: tempfile::TempDir,
    store: CheckpointStore,
    state: StateHandle,
    bus: Arc<RecordingBus>,
    tickets: Arc<StubTickets>,
    registry: Arc<BlockerRegistry>,
    sandbox_root: std::path::PathBuf,
}

impl BlockerHarness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("state"));
        let mut state = ExecutionState::new("proj");
        state.add_task(TaskRecord::new("t1", "Task t1", "auth"));
        let state = StateHandle::new(state, store.clone());

        let bus = Arc::new(RecordingBus::new());
        let tickets = Arc::new(StubTickets::new());
        let registry = Arc::new(BlockerRegistry::new(
            Some(Arc::clone(&tickets) as Arc<dyn foreman_tickets::TicketSystem>),
            Arc::clone(&bus) as Arc<dyn StatusBus>,
        ));

        Self {
            sandbox_root: dir.path().join("sandboxes"),
            _dir: dir,
            store,
            state,
            bus,
            tickets,
            registry,
        }
    }

    fn blocked_lead(&self) -> TeamLead {
        let runtime = Arc::new(ScriptedRuntime::new(ServiceScript {
            code_writer: StageBehavior::BlockOnce("which provider?".to_string()),
            unit_tester: StageBehavior::Succeed,
            qa_tester: StageBehavior::Succeed,
        }));
        TeamLead::new(
            "proj",
            "auth",
            self.sandbox_root.join("auth"),
            "",
            "spec",
            vec![TaskSpec::new("t1", "Task t1")],
            TeamLeadConfig {
                retry_count: 0,
                max_turns: 5,
            },
            runtime,
        )
        .with_state(self.state.clone())
        .with_blockers(Arc::clone(&self.registry))
    }

    /// Poll until the blocker notification went out (it is pushed after the
    /// checkpoint), or panic after ~2s.
    async fn wait_for_blocker(&self) -> Arc<foreman_core::blocker::PendingBlocker> {
        for _ in 0..40 {
            if !self.bus.blocker_notifications().is_empty() {
                return self
                    .registry
                    .pending()
                    .into_iter()
                    .next()
                    .expect("notified blocker is registered");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no blocker appeared within 2 seconds");
    }
}

#[tokio::test]
async fn blocker_resolved_by_ticket_comment() {
    let harness = BlockerHarness::new();

    let mut orch = Orchestrator::new(
        "proj",
        OrchestratorConfig::default(),
        Arc::clone(&harness.bus) as Arc<dyn StatusBus>,
    );
    orch.add_team_lead(harness.blocked_lead());
    orch.start().await;

    let blocker = harness.wait_for_blocker().await;
    assert_eq!(blocker.question, "which provider?");
    assert!(!blocker.ticket_id.is_empty());

    // An urgent ticket was filed with the reply-to-resolve instruction.
    let created = harness.tickets.created_issues();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1.priority, 1);
    assert!(created[0].1.title.contains("[auth] BLOCKER"));
    assert!(created[0].1.body.contains("Reply in a comment"));

    // While parked: the task is blocked on disk and in the batch counters.
    let on_disk = harness.store.load("proj").await.unwrap();
    assert_eq!(on_disk.tasks["t1"].status, TaskStatus::Blocked);
    assert!(!on_disk.blockers.is_empty());
    assert!(harness
        .bus
        .batches()
        .iter()
        .any(|m| matches!(m, StatusMessage::WorkerBatch { blocked, .. } if *blocked >= 1)));
    assert!(!harness.bus.blocker_notifications().is_empty());

    // Out-of-band resolution by ticket id (the webhook path).
    let resolved = harness
        .registry
        .resolve_by_ticket(&blocker.ticket_id, "use Google", Some(&harness.state))
        .await;
    assert!(resolved);
    assert_eq!(blocker.answer(), "use Google");

    // The task completes once the answer arrives.
    let results = orch.wait().await;
    assert_eq!(results["auth"].len(), 1);
    assert!(results["auth"][0].success);
    assert_eq!(orch.counters().blocked, 0);

    // A subsequent recovery sees the resolution.
    let recovered = recover(&harness.store, "proj", None).await.unwrap();
    let record = recovered.blockers.values().next().unwrap();
    assert!(record.resolved);
    assert_eq!(record.answer, "use Google");
}

#[tokio::test]
async fn blocker_survives_restart_via_reconciliation() {
    let harness = BlockerHarness::new();

    // Create a blocker, then "crash" before anyone answers.
    let blocker = harness
        .registry
        .create("proj", "auth", "which provider?", Some(&harness.state))
        .await
        .unwrap();
    let ticket_id = blocker.ticket_id.clone();
    harness.registry.clear_all();

    // A human replied on the ticket while the server was down.
    harness.tickets.set_comments(
        &ticket_id,
        vec![
            foreman_tickets::IssueComment {
                body: "hmm, thinking".to_string(),
                created_at: "2026-03-01T10:00:00Z".to_string(),
            },
            foreman_tickets::IssueComment {
                body: "use Google".to_string(),
                created_at: "2026-03-01T11:00:00Z".to_string(),
            },
        ],
    );

    let recovered = recover(
        &harness.store,
        "proj",
        Some(harness.tickets.as_ref() as &dyn foreman_tickets::TicketSystem),
    )
    .await
    .unwrap();

    let record = &recovered.blockers[&blocker.blocker_id];
    assert!(record.resolved);
    assert_eq!(record.answer, "use Google");

    // Unresolved blockers (none here) would be rebuilt as fresh wait-points.
    harness.registry.restore_from_state(&recovered);
    assert!(harness.registry.pending().is_empty());
}

#[tokio::test]
async fn blocker_without_ticket_system_uses_direct_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("state"));
    let mut state = ExecutionState::new("proj");
    state.add_task(TaskRecord::new("t1", "Task t1", "auth"));
    let state = StateHandle::new(state, store);

    let bus = Arc::new(RecordingBus::new());
    let registry = Arc::new(BlockerRegistry::new(None, bus as Arc<dyn StatusBus>));

    let blocker = registry
        .create("proj", "auth", "how many shards?", Some(&state))
        .await
        .unwrap();
    assert!(blocker.ticket_id.is_empty());

    // resolve_by_ticket can't match a ticketless blocker...
    assert!(!registry.resolve_by_ticket("iss-1", "three", None).await);
    // ...but direct resolution works.
    assert!(registry.resolve(&blocker.blocker_id, "three", Some(&state)).await);
    assert_eq!(blocker.await_answer().await, "three");
}
