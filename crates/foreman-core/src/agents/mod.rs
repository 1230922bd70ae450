//! Sub-agent stage runners.
//!
//! Each task is driven through three sandboxed stages: CodeWriter writes the
//! implementation, UnitTester writes and runs tests for it, QATester
//! validates against the business specification only -- it is deliberately
//! denied the technical design. The runners are stateless; sequencing and
//! retries belong to the team lead.

pub mod claude_code;
pub mod runtime;

use std::path::Path;

use tracing::warn;

use foreman_state::records::truncate_chars;

pub use claude_code::ClaudeCodeRuntime;
pub use runtime::{
    AgentInvocation, AgentOutput, AgentRuntime, READ_ONLY_TOOLS, WRITE_TOOLS,
};

/// Output and error are clipped at the dispatcher boundary; the persisted
/// stage record truncates further.
pub const RESULT_OUTPUT_LIMIT: usize = 10_000;

/// A stage worker signals that it needs a human decision by ending its
/// final message with a line of this form.
const BLOCKER_PREFIX: &str = "BLOCKER:";

/// Structured result of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubAgentResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl SubAgentResult {
    fn ok(output: String) -> Self {
        Self {
            success: true,
            output: truncate_chars(&output, RESULT_OUTPUT_LIMIT),
            error: String::new(),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: truncate_chars(&error, RESULT_OUTPUT_LIMIT),
        }
    }
}

/// Extract the question from a `BLOCKER: <question>` line in stage output,
/// if the stage raised one.
pub fn blocker_question(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with(BLOCKER_PREFIX))
        .map(|line| line[BLOCKER_PREFIX.len()..].trim())
        .filter(|q| !q.is_empty())
}

/// Run a CodeWriter stage: implement the task in the sandbox.
///
/// The CodeWriter receives the task prompt and the project-conventions
/// document, with full read/write/shell access to the sandbox.
pub async fn run_code_writer(
    runtime: &dyn AgentRuntime,
    sandbox: &Path,
    task_prompt: &str,
    conventions: &str,
    max_turns: u32,
) -> SubAgentResult {
    let system = format!(
        "You are a CodeWriter agent. Implement the task described below precisely.\n\
         Follow the design signatures exactly.\n\
         Use shared utilities -- never duplicate code.\n\
         Run the linter before finishing.\n\
         If you cannot proceed without a human decision, end your final message\n\
         with a line `BLOCKER: <your question>`.\n\n\
         ## Project Conventions\n{conventions}\n\n\
         ## Working Directory\n{}\n",
        sandbox.display()
    );
    run_stage(
        runtime,
        AgentInvocation::new(system, task_prompt, sandbox, WRITE_TOOLS, max_turns),
        "code_writer",
    )
    .await
}

/// Run a UnitTester stage: write and run tests for the code just produced.
pub async fn run_unit_tester(
    runtime: &dyn AgentRuntime,
    sandbox: &Path,
    task_prompt: &str,
    conventions: &str,
    max_turns: u32,
) -> SubAgentResult {
    let system = format!(
        "You are a UnitTester agent. Write comprehensive unit tests for the implementation.\n\
         Test both happy paths and error cases.\n\
         Mock external services -- never call real APIs.\n\
         Run the full test suite before finishing.\n\
         If you cannot proceed without a human decision, end your final message\n\
         with a line `BLOCKER: <your question>`.\n\n\
         ## Project Conventions\n{conventions}\n\n\
         ## Working Directory\n{}\n",
        sandbox.display()
    );
    run_stage(
        runtime,
        AgentInvocation::new(system, task_prompt, sandbox, WRITE_TOOLS, max_turns),
        "unit_tester",
    )
    .await
}

/// Run a QATester stage: validate against the business specification.
///
/// The QATester receives only the business spec and the test commands --
/// no code context, no technical design -- and may read files and run
/// tests but not write.
pub async fn run_qa_tester(
    runtime: &dyn AgentRuntime,
    sandbox: &Path,
    business_spec: &str,
    test_commands: &[String],
    max_turns: u32,
) -> SubAgentResult {
    let system = format!(
        "You are a QATester agent. Validate the implementation against business specifications.\n\
         You do NOT have access to code or technical architecture.\n\
         Test from a USER perspective only.\n\
         Report results in business language.\n\n\
         ## Working Directory\n{}\n",
        sandbox.display()
    );

    let mut prompt = format!("## Business Specifications\n{business_spec}\n\n## Test Commands\n");
    if test_commands.is_empty() {
        prompt.push_str("No test commands were provided; inspect the sandbox for a test suite.\n");
    } else {
        prompt.push_str("Run these to validate:\n");
        for cmd in test_commands {
            prompt.push_str(&format!("- `{cmd}`\n"));
        }
    }

    run_stage(
        runtime,
        AgentInvocation::new(system, prompt, sandbox, READ_ONLY_TOOLS, max_turns),
        "qa_tester",
    )
    .await
}

/// Run one invocation, translating runtime failures into a failed result.
async fn run_stage(
    runtime: &dyn AgentRuntime,
    invocation: AgentInvocation,
    stage: &str,
) -> SubAgentResult {
    match runtime.run(&invocation).await {
        Ok(output) => SubAgentResult::ok(output.text),
        Err(e) => {
            warn!(stage, error = %format!("{e:#}"), "stage runtime failed");
            SubAgentResult::failed(format!("{e:#}"))
        }
    }
}
