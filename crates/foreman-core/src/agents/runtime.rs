//! The `AgentRuntime` trait -- the adapter interface for the underlying
//! agent engine.
//!
//! Each concrete runtime (Claude Code today) implements this trait. It is
//! intentionally object-safe so it can be held as `Arc<dyn AgentRuntime>`
//! by the team leads.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

/// Tool set for write-capable stages (implement and unit-test).
pub const WRITE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// Tool set for read-only stages (QA may read files and run tests, never
/// edit).
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Bash", "Glob", "Grep"];

/// One agent invocation: everything the runtime needs to do a unit of work
/// inside a sandbox.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub system_prompt: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub allowed_tools: Vec<String>,
    /// Per-stage turn budget.
    pub max_turns: u32,
    pub env_vars: HashMap<String, String>,
}

impl AgentInvocation {
    pub fn new(
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        allowed_tools: &[&str],
        max_turns: u32,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            allowed_tools: allowed_tools.iter().map(|t| t.to_string()).collect(),
            max_turns,
            env_vars: HashMap::new(),
        }
    }
}

/// What came back from a completed invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// The agent's final message text.
    pub text: String,
}

/// Adapter interface for spawning one unit of sandboxed agent work.
///
/// Implementations run the agent to completion and return its final text.
/// A missing or broken runtime returns `Err`; the stage runners translate
/// that into a failed result rather than letting it escape.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Human-readable name for this runtime (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Run the invocation to completion.
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput>;
}

// Compile-time assertion: AgentRuntime must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRuntime) {}
};
