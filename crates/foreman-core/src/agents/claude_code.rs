//! Claude Code runtime adapter.
//!
//! Runs `claude -p --output-format stream-json` as a subprocess, feeds the
//! user prompt on stdin, and folds the JSONL stream into the final message
//! text. The engine treats a missing binary as a failed stage, not a crash,
//! so all spawn problems surface as errors here and are absorbed by the
//! stage runners.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::runtime::{AgentInvocation, AgentOutput, AgentRuntime};

/// Default wall-time limit for one invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Runtime adapter for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Debug, Clone)]
pub struct ClaudeCodeRuntime {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    timeout: Duration,
}

impl ClaudeCodeRuntime {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a custom binary path. Useful for testing and non-standard installs.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClaudeCodeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

/// A line of stream-json output, reduced to what the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamItem {
    /// Text content from an assistant message.
    AssistantText(String),
    /// The final result text.
    ResultText(String),
    /// An error reported by the agent.
    Error(String),
}

/// Parse one JSONL line into zero or more items. `Err` means the line was
/// not valid JSON; callers skip it with a warning.
fn parse_stream_line(line: &str) -> Result<Vec<StreamItem>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;
    let mut items = Vec::new();

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "assistant" => {
            if let Some(content) = v.pointer("/message/content").and_then(|c| c.as_array()) {
                for block in content {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            items.push(StreamItem::AssistantText(text.to_string()));
                        }
                    }
                }
            }
        }
        "result" => {
            if let Some(text) = v.get("result").and_then(|r| r.as_str()) {
                items.push(StreamItem::ResultText(text.to_string()));
            }
        }
        "error" => {
            let message = v
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            items.push(StreamItem::Error(message));
        }
        other => {
            debug!(event_type = other, "ignoring stream-json event type");
        }
    }

    Ok(items)
}

/// Fold collected items into the final output text.
///
/// The last `result` line wins; without one, assistant texts are joined.
fn final_text(items: &[StreamItem]) -> String {
    if let Some(StreamItem::ResultText(text)) = items
        .iter()
        .rev()
        .find(|i| matches!(i, StreamItem::ResultText(_)))
    {
        return text.clone();
    }
    items
        .iter()
        .filter_map(|i| match i {
            StreamItem::AssistantText(text) => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Runtime implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AgentRuntime for ClaudeCodeRuntime {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(invocation.max_turns.to_string())
            .arg("--allowedTools")
            .arg(invocation.allowed_tools.join(","))
            .arg("--append-system-prompt")
            .arg(&invocation.system_prompt);

        cmd.current_dir(&invocation.working_dir);
        for (key, value) in &invocation.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        // Claude Code in `-p` mode reads the user prompt from stdin.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(invocation.prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("agent stdout not captured")?;

        let collect = async {
            let mut items = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_stream_line(trimmed) {
                    Ok(parsed) => items.extend(parsed),
                    Err(e) => {
                        warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                    }
                }
            }
            let status = child.wait().await?;
            anyhow::Ok((items, status))
        };

        // Bind before matching so the collect future (and its borrow of
        // `child`) is dropped before the timeout arm touches the process.
        let collected = tokio::time::timeout(self.timeout, collect).await;
        let (items, status) = match collected {
            Ok(result) => result?,
            Err(_) => {
                terminate(&mut child).await;
                bail!("agent timed out after {:?}", self.timeout);
            }
        };

        let errors: Vec<&str> = items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Error(message) => Some(message.as_str()),
                _ => None,
            })
            .collect();

        if !status.success() {
            bail!(
                "agent exited with {status}{}",
                if errors.is_empty() {
                    String::new()
                } else {
                    format!(": {}", errors.join("; "))
                }
            );
        }

        Ok(AgentOutput {
            text: final_text(&items),
        })
    }
}

/// SIGTERM, wait briefly, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::runtime::WRITE_TOOLS;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_str().unwrap().to_string()
    }

    fn invocation(dir: &std::path::Path) -> AgentInvocation {
        AgentInvocation::new("system", "do the task", dir, WRITE_TOOLS, 10)
    }

    // -- Parsing ------------------------------------------------------------

    #[test]
    fn parse_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#;
        let items = parse_stream_line(line).unwrap();
        assert_eq!(
            items,
            vec![StreamItem::AssistantText("working on it".to_string())]
        );
    }

    #[test]
    fn parse_result_text() {
        let line = r#"{"type":"result","result":"Task done."}"#;
        let items = parse_stream_line(line).unwrap();
        assert_eq!(items, vec![StreamItem::ResultText("Task done.".to_string())]);
    }

    #[test]
    fn parse_error_nested_and_flat() {
        let nested = r#"{"type":"error","error":{"message":"rate limit"}}"#;
        assert_eq!(
            parse_stream_line(nested).unwrap(),
            vec![StreamItem::Error("rate limit".to_string())]
        );
        let flat = r#"{"type":"error","message":"broke"}"#;
        assert_eq!(
            parse_stream_line(flat).unwrap(),
            vec![StreamItem::Error("broke".to_string())]
        );
    }

    #[test]
    fn parse_unknown_type_is_empty() {
        let items = parse_stream_line(r#"{"type":"system","data":"warmup"}"#).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn parse_malformed_is_error() {
        assert!(parse_stream_line("not json").is_err());
    }

    #[test]
    fn final_text_prefers_last_result() {
        let items = vec![
            StreamItem::AssistantText("thinking".to_string()),
            StreamItem::ResultText("first".to_string()),
            StreamItem::ResultText("final".to_string()),
        ];
        assert_eq!(final_text(&items), "final");
    }

    #[test]
    fn final_text_falls_back_to_assistant_messages() {
        let items = vec![
            StreamItem::AssistantText("one".to_string()),
            StreamItem::AssistantText("two".to_string()),
        ];
        assert_eq!(final_text(&items), "one\ntwo");
    }

    // -- Subprocess ---------------------------------------------------------

    #[tokio::test]
    async fn run_collects_result_from_fake_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\n\
             echo '{\"type\":\"result\",\"result\":\"All done.\"}'\n",
        );

        let runtime = ClaudeCodeRuntime::with_binary(script);
        let output = runtime.run(&invocation(tmp.path())).await.unwrap();
        assert_eq!(output.text, "All done.");
    }

    #[tokio::test]
    async fn run_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "bad_agent.sh",
            "echo 'not json'\n\
             echo ''\n\
             echo '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let runtime = ClaudeCodeRuntime::with_binary(script);
        let output = runtime.run(&invocation(tmp.path())).await.unwrap();
        assert_eq!(output.text, "ok");
    }

    #[tokio::test]
    async fn run_missing_binary_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = ClaudeCodeRuntime::with_binary("/nonexistent/path/to/claude");
        let err = runtime.run(&invocation(tmp.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn agent binary"));
    }

    #[tokio::test]
    async fn run_nonzero_exit_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "failing_agent.sh",
            "echo '{\"type\":\"error\",\"message\":\"out of budget\"}'\nexit 1\n",
        );

        let runtime = ClaudeCodeRuntime::with_binary(script);
        let err = runtime.run(&invocation(tmp.path())).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exited"), "got: {msg}");
        assert!(msg.contains("out of budget"), "got: {msg}");
    }

    #[tokio::test]
    async fn run_times_out_and_kills_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_agent.sh", "sleep 3600\n");

        let runtime =
            ClaudeCodeRuntime::with_binary(script).timeout(Duration::from_millis(200));
        let err = runtime.run(&invocation(tmp.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }

    #[tokio::test]
    async fn run_reads_prompt_from_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Echo stdin back as the result text.
        let script = write_script(
            tmp.path(),
            "echo_agent.sh",
            "PROMPT=$(cat)\necho \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"$PROMPT\\\"}\"\n",
        );

        let runtime = ClaudeCodeRuntime::with_binary(script);
        let output = runtime.run(&invocation(tmp.path())).await.unwrap();
        assert_eq!(output.text, "do the task");
    }

    #[test]
    fn runtime_name() {
        assert_eq!(ClaudeCodeRuntime::new().name(), "claude-code");
    }
}
