//! The `Hub` boundary: broadcasting a decrypted-to-the-pipeline (still
//! ciphertext-to-us) message envelope out over whatever long-lived sockets
//! a conversation's participants hold open.
//!
//! The WebSocket handshake/resume layer itself is an external collaborator;
//! this crate only specifies the one primitive the consumer calls and the
//! wire shape of what it sends. [`BroadcastError`] classifies failures with
//! a typed permanent/transient split instead of leaving callers to infer
//! retryability from an error string — see `DESIGN.md`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The data a single conversation message carries across the wire, once
/// decrypted-at-rest content becomes merely ciphertext-in-transit to us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageData {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, rename = "contentSize", skip_serializing_if = "Option::is_none")]
    pub content_size: Option<u64>,
    #[serde(default, rename = "contentMimeType", skip_serializing_if = "Option::is_none")]
    pub content_mime_type: Option<String>,
    #[serde(rename = "occurredAt")]
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopePayload {
    pub seq: Option<u64>,
    pub data: MessageData,
}

/// The WebSocket envelope `Hub.broadcast` sends: `{v, id, type, size, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub v: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: usize,
    pub payload: EnvelopePayload,
}

impl Envelope {
    pub fn for_message(data: MessageData, seq: Option<u64>) -> Self {
        let payload = EnvelopePayload { seq, data };
        let size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        Self {
            v: 1,
            id: uuid::Uuid::new_v4().to_string(),
            kind: "msg".to_string(),
            size,
            payload,
        }
    }
}

/// A broadcast failure, already classified by the `Hub` implementation
/// rather than left for the consumer to infer from a message string.
/// `Permanent` means the envelope itself can never be delivered (malformed,
/// rejected by every connected client) and should go to the DLQ; `Transient`
/// means delivery may succeed on retry (socket backpressure, hub outage)
/// and the broker entry should stay in the PEL for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("permanent broadcast failure: {0}")]
    Permanent(String),
    #[error("transient broadcast failure: {0}")]
    Transient(String),
}

impl BroadcastError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, BroadcastError::Permanent(_))
    }

    /// A string-matching fallback for callers stuck behind a `Hub` that
    /// only returns a plain error message instead of a typed
    /// [`BroadcastError`]. Prefer the typed form when the `Hub`
    /// implementation is under your control.
    pub fn classify_by_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("parse") || lower.contains("validation") || lower.contains("missing required") {
            BroadcastError::Permanent(message.to_string())
        } else {
            BroadcastError::Transient(message.to_string())
        }
    }
}

/// Broadcasts an envelope to every socket subscribed to its conversation.
/// Implemented by the WebSocket layer; the pipeline only ever calls this.
#[async_trait]
pub trait Hub: Send + Sync {
    async fn broadcast(&self, envelope: Envelope) -> Result<(), BroadcastError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> MessageData {
        MessageData {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            ciphertext: "ZW5jcnlwdGVk".to_string(),
            metadata: None,
            content_size: None,
            content_mime_type: None,
            occurred_at: "2026-07-28T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn envelope_serializes_to_expected_wire_shape() {
        let envelope = Envelope::for_message(sample_data(), Some(3));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["type"], "msg");
        assert_eq!(json["payload"]["seq"], 3);
        assert_eq!(json["payload"]["data"]["messageId"], "m1");
        assert!(json["id"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn classify_by_message_matches_parse_and_validation_keywords() {
        assert!(BroadcastError::classify_by_message("JSON parse error").is_permanent());
        assert!(BroadcastError::classify_by_message("validation failed: bad field").is_permanent());
        assert!(BroadcastError::classify_by_message("missing required field ciphertext").is_permanent());
        assert!(!BroadcastError::classify_by_message("connection reset by peer").is_permanent());
    }
}
