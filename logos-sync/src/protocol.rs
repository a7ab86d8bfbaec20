//! JSON envelope protocol between the sync client and the ordering server.
//!
//! Every frame is a text WebSocket message holding one envelope:
//! ```text
//! { "type": "<tag>", "payload": { ... } }
//!
//! client → server   pull          { lastAcknowledgedVersion }
//!                   push          { type: "durable" | "ephemeral", changes }
//!                   relay         { buffer }
//!
//! server → client   relayed       { changes }
//!                   acknowledged  { changes: ServerChange[] }
//!                   rejected      { ids, message }
//! ```
//!
//! Inbound frames go through [`dispatch`], which never fails: unknown tags
//! and malformed payloads are logged and dropped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::{Change, ChangeId, ChangeKind, ServerChange};

/// Outbound intents, client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Ask for every ordered change after `last_acknowledged_version`.
    Pull {
        #[serde(rename = "lastAcknowledgedVersion")]
        last_acknowledged_version: u64,
    },
    /// Submit changes for ordering (durable) or fan-out (ephemeral).
    Push {
        #[serde(rename = "type")]
        kind: ChangeKind,
        changes: Vec<Change>,
    },
    /// Opaque bytes forwarded to the other peers in the room.
    Relay { buffer: Vec<u8> },
}

/// Inbound notifications, server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Ephemeral changes from other peers; not reconciled.
    Relayed { changes: Vec<Change> },
    /// Ordered changes, ascending by version.
    Acknowledged { changes: Vec<ServerChange> },
    /// Identities the server refused to order.
    Rejected { ids: Vec<ChangeId>, message: String },
}

impl ServerMessage {
    /// Tags this client understands.
    pub const TAGS: [&'static str; 3] = ["relayed", "acknowledged", "rejected"];

    pub fn relayed(changes: Vec<Change>) -> Self {
        Self::Relayed { changes }
    }

    pub fn acknowledged(changes: Vec<ServerChange>) -> Self {
        Self::Acknowledged { changes }
    }

    pub fn rejected(ids: Vec<ChangeId>, message: impl Into<String>) -> Self {
        Self::Rejected {
            ids,
            message: message.into(),
        }
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Relayed { .. } => "relayed",
            Self::Acknowledged { .. } => "acknowledged",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a text frame, distinguishing unknown tags from
    /// malformed payloads.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let tag = envelope_tag(text)?;
        if !Self::TAGS.contains(&tag.as_str()) {
            return Err(ProtocolError::UnknownMessageType(tag));
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ClientMessage {
    pub const TAGS: [&'static str; 3] = ["pull", "push", "relay"];

    pub fn pull(last_acknowledged_version: u64) -> Self {
        Self::Pull {
            last_acknowledged_version,
        }
    }

    pub fn push_durable(changes: Vec<Change>) -> Self {
        Self::Push {
            kind: ChangeKind::Durable,
            changes,
        }
    }

    pub fn push_ephemeral(changes: Vec<Change>) -> Self {
        Self::Push {
            kind: ChangeKind::Ephemeral,
            changes,
        }
    }

    pub fn relay(buffer: Vec<u8>) -> Self {
        Self::Relay { buffer }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Pull { .. } => "pull",
            Self::Push { .. } => "push",
            Self::Relay { .. } => "relay",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a text frame (server side and tests).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let tag = envelope_tag(text)?;
        if !Self::TAGS.contains(&tag.as_str()) {
            return Err(ProtocolError::UnknownMessageType(tag));
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Raw envelope, used to read the tag before committing to a variant.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
}

fn envelope_tag(text: &str) -> Result<String, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(envelope.tag)
}

/// Decode an inbound frame, logging and dropping anything unusable.
pub fn dispatch(text: &str) -> Option<ServerMessage> {
    match ServerMessage::decode(text) {
        Ok(msg) => {
            log::debug!("Received {} message", msg.tag());
            Some(msg)
        }
        Err(ProtocolError::UnknownMessageType(tag)) => {
            log::warn!("Dropping message with unknown type {tag:?}");
            None
        }
        Err(e) => {
            log::warn!("Dropping malformed message: {e}");
            None
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_pull_wire_shape() {
        let encoded = ClientMessage::pull(5).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"type": "pull", "payload": {"lastAcknowledgedVersion": 5}})
        );
    }

    #[test]
    fn test_push_wire_shape() {
        let msg = ClientMessage::push_durable(vec![Change::new("a", json!({"n": 1}))]);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "push",
                "payload": {"type": "durable", "changes": [{"id": "a", "payload": {"n": 1}}]}
            })
        );
    }

    #[test]
    fn test_ephemeral_push_kind() {
        let msg = ClientMessage::push_ephemeral(Vec::new());
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["payload"]["type"], json!("ephemeral"));
    }

    #[test]
    fn test_relay_wire_shape() {
        let value: Value =
            serde_json::from_str(&ClientMessage::relay(vec![1, 2, 3]).encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "relay", "payload": {"buffer": [1, 2, 3]}}));
    }

    #[test]
    fn test_decode_acknowledged() {
        let text = r#"{"type":"acknowledged","payload":{"changes":[{"id":"a","version":1,"payload":{"x":1}}]}}"#;
        let msg = ServerMessage::decode(text).unwrap();
        assert_eq!(
            msg,
            ServerMessage::acknowledged(vec![ServerChange::new("a", 1, json!({"x": 1}))])
        );
    }

    #[test]
    fn test_decode_rejected() {
        let text = r#"{"type":"rejected","payload":{"ids":["a","b"],"message":"stale"}}"#;
        match ServerMessage::decode(text).unwrap() {
            ServerMessage::Rejected { ids, message } => {
                assert_eq!(ids, vec![ChangeId::from("a"), ChangeId::from("b")]);
                assert_eq!(message, "stale");
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_tag() {
        let err = ServerMessage::decode(r#"{"type":"bogus","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType("bogus".into()));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = ServerMessage::decode(r#"{"type":"acknowledged","payload":{"changes":7}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializationError(_)));
    }

    #[test]
    fn test_dispatch_drops_garbage() {
        assert!(dispatch("not json at all").is_none());
        assert!(dispatch(r#"{"payload":{}}"#).is_none());
        assert!(dispatch(r#"{"type":"pull","payload":{"lastAcknowledgedVersion":0}}"#).is_none());
    }

    #[test]
    fn test_dispatch_passes_relayed() {
        let text = ServerMessage::relayed(vec![Change::new("e", json!({}))])
            .encode()
            .unwrap();
        assert!(matches!(dispatch(&text), Some(ServerMessage::Relayed { .. })));
    }

    #[test]
    fn test_client_decode_for_server_side() {
        let text = ClientMessage::pull(3).encode().unwrap();
        assert_eq!(ClientMessage::decode(&text).unwrap(), ClientMessage::pull(3));
        assert!(ClientMessage::decode(r#"{"type":"acknowledged","payload":{}}"#).is_err());
    }
}
