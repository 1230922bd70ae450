//! Blocker registry -- asynchronous wait-points for human decisions.
//!
//! A stage that cannot proceed without a human acquires a
//! [`PendingBlocker`] and awaits it. Resolution arrives from an unrelated
//! path (the ticket webhook, recovery reconciliation, or a direct resolve
//! call) and releases every waiter. The release latch is sticky and
//! non-consuming: once resolved, a blocker stays resolved and the first
//! answer wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman_state::records::truncate_chars;
use foreman_state::{BlockerRecord, ExecutionState, StateHandle};
use foreman_tickets::{NewIssue, TicketSystem};

use crate::status::{send_best_effort, StatusBus, StatusMessage};

/// Ticket titles embed the question, clipped to keep them scannable.
const TICKET_TITLE_LIMIT: usize = 80;

/// An active wait-point. Shared between the waiting stage and whatever
/// path delivers the resolution.
pub struct PendingBlocker {
    pub blocker_id: String,
    pub service_name: String,
    pub question: String,
    pub ticket_id: String,
    pub ticket_url: String,
    latch: CancellationToken,
    answer: Mutex<String>,
}

impl PendingBlocker {
    fn new(
        blocker_id: String,
        service_name: String,
        question: String,
        ticket_id: String,
        ticket_url: String,
    ) -> Self {
        Self {
            blocker_id,
            service_name,
            question,
            ticket_id,
            ticket_url,
            latch: CancellationToken::new(),
            answer: Mutex::new(String::new()),
        }
    }

    /// Wait for resolution and return the answer. Non-consuming: any number
    /// of callers may await, before or after the release.
    pub async fn await_answer(&self) -> String {
        self.latch.cancelled().await;
        self.answer.lock().expect("answer lock poisoned").clone()
    }

    /// Whether the blocker has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.latch.is_cancelled()
    }

    /// The answer, or empty if unresolved.
    pub fn answer(&self) -> String {
        self.answer.lock().expect("answer lock poisoned").clone()
    }

    /// Store the answer and trip the latch. Returns `false` if the blocker
    /// was already resolved; the stored answer is not overwritten.
    fn release(&self, answer: &str) -> bool {
        let mut slot = self.answer.lock().expect("answer lock poisoned");
        if self.latch.is_cancelled() {
            return false;
        }
        // The answer must be in place before the release is observable.
        *slot = answer.to_string();
        self.latch.cancel();
        true
    }
}

impl std::fmt::Debug for PendingBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBlocker")
            .field("blocker_id", &self.blocker_id)
            .field("service_name", &self.service_name)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Process-wide table of active blockers.
///
/// The checkpoint file, not this registry, is the source of truth: the
/// registry can always be rebuilt from the file plus a fresh pass of ticket
/// comments ([`BlockerRegistry::restore_from_state`]).
pub struct BlockerRegistry {
    blockers: Mutex<HashMap<String, Arc<PendingBlocker>>>,
    tickets: Option<Arc<dyn TicketSystem>>,
    bus: Arc<dyn StatusBus>,
}

impl BlockerRegistry {
    pub fn new(tickets: Option<Arc<dyn TicketSystem>>, bus: Arc<dyn StatusBus>) -> Self {
        Self {
            blockers: Mutex::new(HashMap::new()),
            tickets,
            bus,
        }
    }

    /// Create a blocker: optional urgent ticket, registry entry, checkpoint
    /// record, observer notification. Ticket failure degrades to a blocker
    /// without a ticket; checkpoint failure propagates.
    pub async fn create(
        &self,
        project_id: &str,
        service_name: &str,
        question: &str,
        state: Option<&StateHandle>,
    ) -> anyhow::Result<Arc<PendingBlocker>> {
        let blocker_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let mut ticket_id = String::new();
        let mut ticket_url = String::new();
        if let Some(tickets) = &self.tickets {
            let title = format!(
                "[{service_name}] BLOCKER: {}",
                truncate_chars(question, TICKET_TITLE_LIMIT)
            );
            let body = format!(
                "## Blocker\n\n**Service**: {service_name}\n\n**Question**: {question}\n\n\
                 ---\n*Reply in a comment to resolve this blocker.*"
            );
            match tickets.create_issue(NewIssue::urgent(title, body)).await {
                Ok(issue) => {
                    info!(
                        issue_id = %issue.id,
                        service_name,
                        "created blocker ticket"
                    );
                    ticket_id = issue.id;
                    ticket_url = issue.url;
                }
                Err(e) => {
                    error!(error = %e, service_name, "failed to create blocker ticket");
                }
            }
        }

        let blocker = Arc::new(PendingBlocker::new(
            blocker_id.clone(),
            service_name.to_string(),
            question.to_string(),
            ticket_id.clone(),
            ticket_url.clone(),
        ));
        self.blockers
            .lock()
            .expect("registry lock poisoned")
            .insert(blocker_id.clone(), Arc::clone(&blocker));

        if let Some(state) = state {
            state
                .blocker_created(BlockerRecord {
                    blocker_id: blocker_id.clone(),
                    service_name: service_name.to_string(),
                    question: question.to_string(),
                    ticket_id,
                    ticket_url: ticket_url.clone(),
                    resolved: false,
                    answer: String::new(),
                })
                .await?;
        }

        send_best_effort(
            self.bus.as_ref(),
            project_id,
            &StatusMessage::BlockerNotification {
                blocker_id: blocker_id.clone(),
                service_name: service_name.to_string(),
                question: question.to_string(),
                linear_issue_url: ticket_url,
                resolved: false,
            },
        )
        .await;

        info!(blocker_id = %blocker_id, service_name, question, "blocker created");
        Ok(blocker)
    }

    /// Resolve a blocker. Returns `true` if the id was known. The latch is
    /// one-shot: a second resolve keeps the first answer.
    pub async fn resolve(
        &self,
        blocker_id: &str,
        answer: &str,
        state: Option<&StateHandle>,
    ) -> bool {
        let blocker = {
            let table = self.blockers.lock().expect("registry lock poisoned");
            table.get(blocker_id).cloned()
        };
        let Some(blocker) = blocker else {
            warn!(blocker_id, "no blocker found with this id");
            return false;
        };

        if !blocker.release(answer) {
            info!(blocker_id, "blocker already resolved, keeping first answer");
            return true;
        }

        if let Some(state) = state {
            if let Err(e) = state.blocker_resolved(blocker_id, answer).await {
                error!(blocker_id, error = %e, "failed to checkpoint blocker resolution");
            }
        }

        info!(
            blocker_id,
            answer = %truncate_chars(answer, 100),
            "blocker resolved"
        );
        true
    }

    /// Resolve a blocker by its external ticket id (webhook path).
    pub async fn resolve_by_ticket(
        &self,
        ticket_id: &str,
        answer: &str,
        state: Option<&StateHandle>,
    ) -> bool {
        let blocker_id = {
            let table = self.blockers.lock().expect("registry lock poisoned");
            table
                .values()
                .find(|b| !b.ticket_id.is_empty() && b.ticket_id == ticket_id)
                .map(|b| b.blocker_id.clone())
        };
        match blocker_id {
            Some(id) => self.resolve(&id, answer, state).await,
            None => {
                warn!(ticket_id, "no blocker found for ticket");
                false
            }
        }
    }

    /// Rebuild wait-points for every unresolved blocker record, so freshly
    /// started workers can await them after a restart.
    pub fn restore_from_state(&self, state: &ExecutionState) {
        let mut table = self.blockers.lock().expect("registry lock poisoned");
        for record in state.blockers.values().filter(|b| !b.resolved) {
            table.insert(
                record.blocker_id.clone(),
                Arc::new(PendingBlocker::new(
                    record.blocker_id.clone(),
                    record.service_name.clone(),
                    record.question.clone(),
                    record.ticket_id.clone(),
                    record.ticket_url.clone(),
                )),
            );
        }
    }

    /// Look up an active blocker.
    pub fn get(&self, blocker_id: &str) -> Option<Arc<PendingBlocker>> {
        self.blockers
            .lock()
            .expect("registry lock poisoned")
            .get(blocker_id)
            .cloned()
    }

    /// Snapshot of all active blockers, for status reporting.
    pub fn pending(&self) -> Vec<Arc<PendingBlocker>> {
        self.blockers
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Drop a blocker from the registry after its waiter has consumed it.
    pub fn cleanup(&self, blocker_id: &str) {
        self.blockers
            .lock()
            .expect("registry lock poisoned")
            .remove(blocker_id);
    }

    /// Clear the registry (shutdown and tests).
    pub fn clear_all(&self) {
        self.blockers
            .lock()
            .expect("registry lock poisoned")
            .clear();
    }
}

impl std::fmt::Debug for BlockerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.blockers.lock().expect("registry lock poisoned");
        f.debug_struct("BlockerRegistry")
            .field("active", &table.keys().collect::<Vec<_>>())
            .field("ticket_system", &self.tickets.is_some())
            .finish()
    }
}
