//! Narrow interface to the external ticket system.
//!
//! The engine talks to its ticket tracker through the [`TicketSystem`]
//! trait: create an urgent issue when a blocker is raised, and read the
//! comments on an issue when reconciling blockers after a restart.
//! [`client::GraphQlTicketClient`] is the production implementation;
//! tests substitute their own.

pub mod client;
pub mod models;
pub mod webhook;

use async_trait::async_trait;

pub use client::{GraphQlTicketClient, TicketError};
pub use models::{Issue, IssueComment, NewIssue};
pub use webhook::{verify_signature, WebhookPayload};

/// Adapter interface for the external ticket tracker.
///
/// Object-safe so it can be held as `Arc<dyn TicketSystem>` by the blocker
/// registry and passed as `&dyn TicketSystem` into recovery.
#[async_trait]
pub trait TicketSystem: Send + Sync {
    /// Create an issue and return its id and URL.
    async fn create_issue(&self, issue: NewIssue) -> Result<Issue, TicketError>;

    /// List the comments on an issue, oldest first.
    async fn issue_comments(&self, issue_id: &str) -> Result<Vec<IssueComment>, TicketError>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TicketSystem) {}
};
