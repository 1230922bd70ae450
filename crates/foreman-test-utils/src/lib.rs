//! Shared test fixtures for foreman integration tests.
//!
//! Provides a scripted agent runtime (per-service, per-stage behaviors), a
//! recording status bus, and a stub ticket system, so engine tests never
//! touch a real agent binary or tracker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use foreman_core::agents::{AgentInvocation, AgentOutput, AgentRuntime};
use foreman_core::status::{StatusBus, StatusMessage};
use foreman_tickets::{Issue, IssueComment, NewIssue, TicketError, TicketSystem};

// ---------------------------------------------------------------------------
// Scripted agent runtime
// ---------------------------------------------------------------------------

/// What a scripted stage does when invoked.
#[derive(Debug, Clone)]
pub enum StageBehavior {
    /// Succeed with a fixed output.
    Succeed,
    /// Succeed with custom output text.
    SucceedWith(String),
    /// Fail (runtime error) for the first `n` calls, then succeed.
    FailTimes(u32),
    /// Always fail.
    Fail,
    /// Raise a blocker on the first call, succeed afterwards.
    BlockOnce(String),
    /// Panic when invoked. Simulates a lead crash.
    Panic,
    /// Never return. Simulates a long-running external stage.
    Hang,
}

/// Per-service stage script.
#[derive(Debug, Clone)]
pub struct ServiceScript {
    pub code_writer: StageBehavior,
    pub unit_tester: StageBehavior,
    pub qa_tester: StageBehavior,
}

impl ServiceScript {
    pub fn all_succeed() -> Self {
        Self {
            code_writer: StageBehavior::Succeed,
            unit_tester: StageBehavior::Succeed,
            qa_tester: StageBehavior::Succeed,
        }
    }
}

impl Default for ServiceScript {
    fn default() -> Self {
        Self::all_succeed()
    }
}

/// Agent runtime whose behavior is scripted per service and stage.
///
/// The stage is recognized from the system prompt's role framing; the
/// service from the sandbox directory name (leads sandbox at
/// `<root>/<service>`).
pub struct ScriptedRuntime {
    default: ServiceScript,
    per_service: HashMap<String, ServiceScript>,
    calls: Mutex<HashMap<(String, String), u32>>,
    total_calls: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(default: ServiceScript) -> Self {
        Self {
            default,
            per_service: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicUsize::new(0),
        }
    }

    pub fn all_succeed() -> Self {
        Self::new(ServiceScript::all_succeed())
    }

    /// Override the script for one service.
    pub fn with_service(mut self, service: impl Into<String>, script: ServiceScript) -> Self {
        self.per_service.insert(service.into(), script);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Calls seen for one (service, stage) pair.
    pub fn calls_for(&self, service: &str, stage: &str) -> u32 {
        *self
            .calls
            .lock()
            .unwrap()
            .get(&(service.to_string(), stage.to_string()))
            .unwrap_or(&0)
    }

    fn classify_stage(system_prompt: &str) -> &'static str {
        if system_prompt.contains("CodeWriter agent") {
            "code_writer"
        } else if system_prompt.contains("UnitTester agent") {
            "unit_tester"
        } else {
            "qa_tester"
        }
    }

    fn service_of(working_dir: &Path) -> String {
        working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let stage = Self::classify_stage(&invocation.system_prompt);
        let service = Self::service_of(&invocation.working_dir);

        let count = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls
                .entry((service.clone(), stage.to_string()))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        let script = self.per_service.get(&service).unwrap_or(&self.default);
        let behavior = match stage {
            "code_writer" => &script.code_writer,
            "unit_tester" => &script.unit_tester,
            _ => &script.qa_tester,
        };

        match behavior {
            StageBehavior::Succeed => Ok(AgentOutput {
                text: format!("{stage} ok"),
            }),
            StageBehavior::SucceedWith(text) => Ok(AgentOutput { text: text.clone() }),
            StageBehavior::FailTimes(n) => {
                if count <= *n {
                    anyhow::bail!("{stage} scripted failure (call {count})")
                }
                Ok(AgentOutput {
                    text: format!("{stage} ok after {count} calls"),
                })
            }
            StageBehavior::Fail => anyhow::bail!("{stage} scripted failure"),
            StageBehavior::BlockOnce(question) => {
                if count == 1 {
                    Ok(AgentOutput {
                        text: format!("partial work\nBLOCKER: {question}"),
                    })
                } else {
                    Ok(AgentOutput {
                        text: format!("{stage} ok with decision"),
                    })
                }
            }
            StageBehavior::Panic => panic!("{stage} scripted panic"),
            StageBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording status bus
// ---------------------------------------------------------------------------

/// Status bus that records every message for later assertions.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, StatusMessage)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, StatusMessage)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<StatusMessage> {
        self.messages()
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| matches!(m, StatusMessage::WorkerBatch { .. }))
            .collect()
    }

    pub fn worker_statuses(&self) -> Vec<StatusMessage> {
        self.messages()
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| matches!(m, StatusMessage::WorkerStatus { .. }))
            .collect()
    }

    pub fn blocker_notifications(&self) -> Vec<StatusMessage> {
        self.messages()
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| matches!(m, StatusMessage::BlockerNotification { .. }))
            .collect()
    }
}

#[async_trait]
impl StatusBus for RecordingBus {
    async fn send(&self, observer_key: &str, message: &StatusMessage) -> bool {
        self.messages
            .lock()
            .unwrap()
            .push((observer_key.to_string(), message.clone()));
        true
    }
}

// ---------------------------------------------------------------------------
// Stub ticket system
// ---------------------------------------------------------------------------

/// Ticket system stub: issues get sequential ids, comments are scripted.
#[derive(Default)]
pub struct StubTickets {
    next_id: AtomicUsize,
    created: Mutex<Vec<(String, NewIssue)>>,
    comments: Mutex<HashMap<String, Vec<IssueComment>>>,
    fail_comments: std::sync::atomic::AtomicBool,
}

impl StubTickets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues created so far, as `(issue_id, input)`.
    pub fn created_issues(&self) -> Vec<(String, NewIssue)> {
        self.created.lock().unwrap().clone()
    }

    /// Script the comments returned for an issue.
    pub fn set_comments(&self, issue_id: &str, comments: Vec<IssueComment>) {
        self.comments
            .lock()
            .unwrap()
            .insert(issue_id.to_string(), comments);
    }

    /// Make comment queries fail, simulating tracker downtime.
    pub fn fail_comment_queries(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TicketSystem for StubTickets {
    async fn create_issue(&self, issue: NewIssue) -> Result<Issue, TicketError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("iss-{n}");
        self.created.lock().unwrap().push((id.clone(), issue));
        Ok(Issue {
            id: id.clone(),
            identifier: format!("ENG-{n}"),
            url: format!("https://tracker.test/{id}"),
        })
    }

    async fn issue_comments(&self, issue_id: &str) -> Result<Vec<IssueComment>, TicketError> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(TicketError::Api("tracker unavailable".to_string()));
        }
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(issue_id)
            .cloned()
            .unwrap_or_default())
    }
}
