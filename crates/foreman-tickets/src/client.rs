//! GraphQL HTTP client for the ticket tracker.
//!
//! Implements the two operations the engine needs (issue creation and
//! comment listing) against a Linear-style GraphQL endpoint. Rate-limit
//! responses (429) are retried with the server-supplied delay.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::models::{Issue, IssueComment, NewIssue};
use crate::TicketSystem;

/// Maximum attempts per request before giving up on rate limiting.
const MAX_ATTEMPTS: u32 = 3;

/// Errors returned by ticket-system operations.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ticket API returned errors: {0}")]
    Api(String),

    #[error("unexpected response shape: {0}")]
    Malformed(String),

    #[error("rate limit exceeded after {MAX_ATTEMPTS} attempts")]
    RateLimited,
}

/// Async GraphQL client for the ticket tracker.
#[derive(Debug, Clone)]
pub struct GraphQlTicketClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    team_id: String,
}

impl GraphQlTicketClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        team_id: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default TLS backend is available");
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            team_id: team_id.into(),
        }
    }

    /// Execute a GraphQL request, retrying on 429.
    async fn request(&self, query: &str, variables: Value) -> Result<Value, TicketError> {
        let payload = json!({ "query": query, "variables": variables });

        for attempt in 0..MAX_ATTEMPTS {
            let resp = self
                .http
                .post(&self.api_url)
                .header("Authorization", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&payload)
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(2.0 * f64::from(attempt + 1));
                warn!(wait_secs = wait, "ticket API rate-limited, backing off");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }

            let resp = resp.error_for_status()?;
            let body: Value = resp.json().await?;
            if let Some(errors) = body.get("errors") {
                return Err(TicketError::Api(errors.to_string()));
            }
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }

        Err(TicketError::RateLimited)
    }
}

#[async_trait]
impl TicketSystem for GraphQlTicketClient {
    async fn create_issue(&self, issue: NewIssue) -> Result<Issue, TicketError> {
        let query = "\
            mutation($input: IssueCreateInput!) {\n\
                issueCreate(input: $input) {\n\
                    success\n\
                    issue { id identifier url }\n\
                }\n\
            }";
        let variables = json!({
            "input": {
                "title": issue.title,
                "description": issue.body,
                "teamId": self.team_id,
                "priority": issue.priority,
            }
        });

        let data = self.request(query, variables).await?;
        let node = data
            .pointer("/issueCreate/issue")
            .ok_or_else(|| TicketError::Malformed("issueCreate.issue missing".to_string()))?;

        Ok(Issue {
            id: string_field(node, "id")?,
            identifier: node
                .get("identifier")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            url: node
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn issue_comments(&self, issue_id: &str) -> Result<Vec<IssueComment>, TicketError> {
        let query = "\
            query($id: String!) {\n\
                issue(id: $id) {\n\
                    comments { nodes { body createdAt } }\n\
                }\n\
            }";
        let data = self.request(query, json!({ "id": issue_id })).await?;

        let nodes = data
            .pointer("/issue/comments/nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| TicketError::Malformed("issue.comments.nodes missing".to_string()))?;

        let mut comments: Vec<IssueComment> = nodes
            .iter()
            .map(|n| IssueComment {
                body: n
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                created_at: n
                    .get("createdAt")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();

        // The API does not guarantee ordering; sort oldest first so callers
        // can take `.last()` as the most recent.
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }
}

fn string_field(node: &Value, key: &str) -> Result<String, TicketError> {
    node.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TicketError::Malformed(format!("missing string field {key:?}")))
}
