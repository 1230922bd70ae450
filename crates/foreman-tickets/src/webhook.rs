//! Inbound webhook payloads and delivery verification.
//!
//! The tracker POSTs an event whenever an issue or comment changes. The
//! engine only cares about comment creation (it may resolve a blocker),
//! and rejects deliveries whose HMAC-SHA256 signature does not match the
//! shared secret.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A webhook delivery from the ticket tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// "create", "update", "remove".
    pub action: String,
    /// Resource type: "Issue", "Comment", ...
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub data: Value,
}

impl WebhookPayload {
    /// Whether this delivery is a comment-creation event.
    pub fn is_comment_created(&self) -> bool {
        self.action == "create" && self.resource_type == "Comment"
    }

    /// Issue id for a comment event. Trackers ship it either flat
    /// (`data.issueId`) or nested (`data.issue.id`).
    pub fn comment_issue_id(&self) -> Option<&str> {
        self.data
            .get("issueId")
            .and_then(Value::as_str)
            .or_else(|| self.data.pointer("/issue/id").and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    }

    /// Comment body for a comment event.
    pub fn comment_body(&self) -> &str {
        self.data
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Verify an HMAC-SHA256 webhook signature (hex-encoded) over the raw body.
///
/// Comparison is constant-time via the hmac crate's `verify_slice`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the hex signature for a body. Test helper and client-side signer.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_roundtrip() {
        let body = br#"{"action":"create","type":"Comment"}"#;
        let sig = sign("secret", body);
        assert!(verify_signature("secret", body, &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let body = b"payload";
        let sig = sign("secret", body);
        assert!(!verify_signature("other", body, &sig));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let sig = sign("secret", b"payload");
        assert!(!verify_signature("secret", b"payload!", &sig));
    }

    #[test]
    fn verify_rejects_non_hex_signature() {
        assert!(!verify_signature("secret", b"payload", "not hex at all"));
    }

    #[test]
    fn comment_event_flat_issue_id() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"action":"create","type":"Comment","data":{"issueId":"iss-1","body":"use Google"}}"#,
        )
        .unwrap();
        assert!(payload.is_comment_created());
        assert_eq!(payload.comment_issue_id(), Some("iss-1"));
        assert_eq!(payload.comment_body(), "use Google");
    }

    #[test]
    fn comment_event_nested_issue_id() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"action":"create","type":"Comment","data":{"issue":{"id":"iss-2"},"body":"ok"}}"#,
        )
        .unwrap();
        assert_eq!(payload.comment_issue_id(), Some("iss-2"));
    }

    #[test]
    fn non_comment_event_is_ignored() {
        let payload: WebhookPayload =
            serde_json::from_str(r#"{"action":"update","type":"Issue","data":{}}"#).unwrap();
        assert!(!payload.is_comment_created());
        assert_eq!(payload.comment_issue_id(), None);
    }
}
