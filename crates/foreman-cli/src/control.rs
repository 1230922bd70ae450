//! Thin HTTP client for the control server.
//!
//! The `pause` / `resume` / `status` / `retry` / `resolve` commands talk to
//! the `foreman run` process over localhost.

use anyhow::{Context, Result};
use serde_json::Value;

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

pub async fn get(port: u16, path: &str) -> Result<Value> {
    let url = format!("{}{path}", base_url(port));
    let resp = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("is `foreman run` active? failed to reach {url}"))?
        .error_for_status()?;
    resp.json().await.context("malformed control response")
}

pub async fn post(port: u16, path: &str, body: Option<Value>) -> Result<Value> {
    let url = format!("{}{path}", base_url(port));
    let client = reqwest::Client::new();
    let mut request = client.post(&url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let resp = request
        .send()
        .await
        .with_context(|| format!("is `foreman run` active? failed to reach {url}"))?
        .error_for_status()?;
    resp.json().await.context("malformed control response")
}
