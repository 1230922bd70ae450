//! Local control and webhook server.
//!
//! While `foreman run` drives the engine, this router exposes the engine's
//! lifecycle commands on localhost and receives ticket-tracker webhooks.
//! Comment-creation deliveries resolve blockers; all deliveries are
//! rejected unless their HMAC-SHA256 signature matches the shared secret
//! (when one is configured).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use foreman_core::blocker::BlockerRegistry;
use foreman_core::orchestrator::Orchestrator;
use foreman_state::StateHandle;
use foreman_tickets::webhook::{verify_signature, WebhookPayload};

/// Header carrying the webhook signature.
const SIGNATURE_HEADER: &str = "linear-signature";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<BlockerRegistry>,
    pub state: StateHandle,
    /// Hex-decodable shared secret; empty disables verification.
    pub webhook_secret: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/tickets", post(ticket_webhook))
        .route("/api/status", get(status))
        .route("/api/pause", post(pause_all))
        .route("/api/resume", post(resume_all))
        .route("/api/services/{name}/pause", post(pause_service))
        .route("/api/services/{name}/resume", post(resume_service))
        .route("/api/blockers/{id}/resolve", post(resolve_blocker))
        .route("/api/shutdown", post(shutdown))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until the token is cancelled.
pub async fn run_server(state: AppState, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("control server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("control server shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ticket_webhook(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    if !app.webhook_secret.is_empty() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing signature"))?;
        if !verify_signature(&app.webhook_secret, &body, signature) {
            return Err(AppError::unauthorized("invalid signature"));
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("malformed webhook payload: {e}")))?;
    info!(
        action = %payload.action,
        resource_type = %payload.resource_type,
        "ticket webhook received"
    );

    if payload.is_comment_created() {
        match payload.comment_issue_id() {
            Some(issue_id) => {
                let resolved = app
                    .registry
                    .resolve_by_ticket(issue_id, payload.comment_body(), Some(&app.state))
                    .await;
                if resolved {
                    info!(issue_id, "blocker resolved via webhook comment");
                }
            }
            None => {
                warn!("comment webhook missing issue id, skipping");
            }
        }
    }

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = app.orchestrator.get_status();
    Json(serde_json::to_value(&snapshot).unwrap_or_default())
}

async fn pause_all(State(app): State<AppState>) -> Json<serde_json::Value> {
    app.orchestrator.pause_all();
    Json(serde_json::json!({ "status": "paused" }))
}

async fn resume_all(State(app): State<AppState>) -> Json<serde_json::Value> {
    app.orchestrator.resume_all();
    Json(serde_json::json!({ "status": "resumed" }))
}

async fn pause_service(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !app.orchestrator.pause_service(&name) {
        return Err(AppError::not_found(format!("no service named {name:?}")));
    }
    Ok(Json(serde_json::json!({ "status": "paused", "service": name })))
}

async fn resume_service(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !app.orchestrator.resume_service(&name) {
        return Err(AppError::not_found(format!("no service named {name:?}")));
    }
    Ok(Json(serde_json::json!({ "status": "resumed", "service": name })))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    answer: String,
}

async fn resolve_blocker(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !app.registry.resolve(&id, &body.answer, Some(&app.state)).await {
        return Err(AppError::not_found(format!("no blocker with id {id:?}")));
    }
    Ok(Json(serde_json::json!({ "status": "resolved", "blocker_id": id })))
}

async fn shutdown(State(app): State<AppState>) -> Json<serde_json::Value> {
    app.orchestrator.shutdown();
    Json(serde_json::json!({ "status": "shutting_down" }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
