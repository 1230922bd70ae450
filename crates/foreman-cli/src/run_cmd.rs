//! `foreman run` -- create or recover a project's execution state, drive
//! the engine to completion, and serve the control/webhook API while it
//! runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use foreman_core::agents::{AgentRuntime, ClaudeCodeRuntime};
use foreman_core::blocker::BlockerRegistry;
use foreman_core::lead::{TeamLead, TeamLeadConfig};
use foreman_core::orchestrator::{LeadContext, Orchestrator, OrchestratorConfig};
use foreman_core::status::{BroadcastStatusBus, StatusBus};
use foreman_state::{recover, CheckpointStore, StateHandle};
use foreman_tickets::{GraphQlTicketClient, TicketSystem};

use crate::config::ForemanConfig;
use crate::plan::load_plan;
use crate::serve::{run_server, AppState};

#[derive(Debug)]
pub struct RunArgs {
    pub plan: PathBuf,
    pub max_leads: Option<usize>,
    pub retry_count: Option<u32>,
    pub port: Option<u16>,
}

pub async fn run(config: ForemanConfig, args: RunArgs) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let project_id = plan.state.project_id.clone();

    let store = CheckpointStore::new(config.data_dir.join("projects"));
    let sandbox_root = config.data_dir.join("sandboxes").join(&project_id);

    let bus: Arc<BroadcastStatusBus> = Arc::new(BroadcastStatusBus::new(256));
    spawn_status_logger(&bus);
    let bus: Arc<dyn StatusBus> = bus;

    let tickets: Option<Arc<dyn TicketSystem>> = if config.tickets_enabled() {
        Some(Arc::new(GraphQlTicketClient::new(
            &config.ticket_api_url,
            &config.ticket_api_key,
            &config.ticket_team_id,
        )))
    } else {
        info!("ticket system not configured; blockers resolve via the control API only");
        None
    };

    let registry = Arc::new(BlockerRegistry::new(tickets.clone(), Arc::clone(&bus)));
    let runtime: Arc<dyn AgentRuntime> =
        Arc::new(ClaudeCodeRuntime::with_binary(&config.agent_binary));
    let lead_config = TeamLeadConfig {
        retry_count: args.retry_count.unwrap_or(config.retry_count),
        max_turns: config.max_turns,
    };
    let orch_config = OrchestratorConfig {
        max_concurrent_leads: args.max_leads.unwrap_or(config.max_concurrent_leads),
    };

    let (state, orchestrator) = if store.exists(&project_id) {
        info!(project_id = %project_id, "checkpoint found, recovering");
        let recovered = recover(&store, &project_id, tickets.as_deref()).await?;
        registry.restore_from_state(&recovered);

        for service in recovered.services.keys() {
            ensure_sandbox(&sandbox_root, service)?;
        }

        let state = StateHandle::new(recovered, store.clone());
        let ctx = LeadContext {
            sandbox_root: sandbox_root.clone(),
            conventions: plan.conventions.clone(),
            business_spec: plan.business_spec.clone(),
            runtime,
            blockers: Some(Arc::clone(&registry)),
            lead_config,
        };
        let orch =
            Orchestrator::from_execution_state(&state, &ctx, orch_config, Arc::clone(&bus)).await;
        (state, orch)
    } else {
        info!(project_id = %project_id, "no checkpoint, starting fresh");
        let state = StateHandle::new(plan.state, store.clone());
        state.flush().await?;

        let mut orch = Orchestrator::new(&project_id, orch_config, Arc::clone(&bus));
        for (service, specs) in &plan.specs {
            ensure_sandbox(&sandbox_root, service)?;
            let lead = TeamLead::new(
                &project_id,
                service,
                sandbox_root.join(service),
                plan.conventions.clone(),
                plan.business_spec.clone(),
                specs.clone(),
                lead_config,
                Arc::clone(&runtime),
            )
            .with_state(state.clone())
            .with_blockers(Arc::clone(&registry));
            orch.add_team_lead(lead);
        }
        (state, orch)
    };

    let orchestrator = Arc::new(orchestrator);

    // Control/webhook server runs for the lifetime of the engine.
    let server_cancel = CancellationToken::new();
    let server = tokio::spawn(run_server(
        AppState {
            orchestrator: Arc::clone(&orchestrator),
            registry: Arc::clone(&registry),
            state: state.clone(),
            webhook_secret: config.webhook_secret.clone(),
        },
        args.port.unwrap_or(config.port),
        server_cancel.child_token(),
    ));

    orchestrator.start().await;

    // Ctrl+C cancels the leads; wait() then drains promptly and the next
    // run recovers anything that was in flight.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                orchestrator.shutdown();
            }
        });
    }

    let results = orchestrator.wait().await;

    let counters = orchestrator.counters();
    println!(
        "{} tasks: {} succeeded, {} failed",
        counters.total_tasks, counters.succeeded, counters.failed
    );
    for (service, service_results) in &results {
        let ok = service_results.iter().filter(|r| r.success).count();
        println!("  {service}: {ok}/{} succeeded", service_results.len());
        for result in service_results.iter().filter(|r| !r.success) {
            println!("    {} failed: {}", result.task_id, result.error);
        }
    }

    server_cancel.cancel();
    let _ = server.await;
    Ok(())
}

fn ensure_sandbox(root: &std::path::Path, service: &str) -> Result<()> {
    let dir = root.join(service);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create sandbox directory {}", dir.display()))
}

/// Mirror the status stream into the log so headless runs are observable.
fn spawn_status_logger(bus: &Arc<BroadcastStatusBus>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok((_, message)) = rx.recv().await {
            info!(message = %serde_json::to_string(&message).unwrap_or_default(), "status");
        }
    });
}
