//! The execution engine: a two-level supervisor that drives multi-stage
//! agent work to completion.
//!
//! The [`orchestrator::Orchestrator`] owns a bounded pool of
//! [`lead::TeamLead`]s, one per service. Each lead runs its service's tasks
//! serially through a three-stage pipeline (implement, verify, validate)
//! dispatched via [`agents`]. Progress is checkpointed through
//! `foreman-state` so a crash loses at most the task that was in flight,
//! and human decisions are modeled as [`blocker`] wait-points resolved
//! out-of-band through the ticket system.

pub mod agents;
pub mod blocker;
pub mod lead;
pub mod orchestrator;
pub mod status;

pub use agents::{AgentInvocation, AgentOutput, AgentRuntime, ClaudeCodeRuntime, SubAgentResult};
pub use blocker::{BlockerRegistry, PendingBlocker};
pub use lead::{TaskResult, TaskSpec, TeamLead, TeamLeadConfig};
pub use orchestrator::{LeadContext, Orchestrator, OrchestratorConfig};
pub use status::{BatchCounters, StatusBus, StatusMessage, StatusReporter, WorkerState};
