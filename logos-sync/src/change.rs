//! Change types exchanged between the local document and the server log.
//!
//! A [`Change`] is one logical edit. Its [`ChangeId`] is stable for the life
//! of the edit: a durable change that is pushed three times is still one
//! change, and the server echoes the same id back when it orders it.
//!
//! Wire shape (JSON):
//! ```text
//! Change       { "id": "…", "payload": <object> }
//! ServerChange { "id": "…", "version": 7, "payload": <object> }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Globally unique identity of a logical edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    /// Fresh random identity for a new edit.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChangeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Immutable delta with a stable identity and an opaque payload.
///
/// The core never looks inside `payload`; the document store decides what
/// it means when asked to apply it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(alias = "identity")]
    pub id: ChangeId,
    pub payload: Value,
}

impl Change {
    pub fn new(id: impl Into<ChangeId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Create a change with a freshly minted identity.
    pub fn with_payload(payload: Value) -> Self {
        Self {
            id: ChangeId::new(),
            payload,
        }
    }
}

/// A change the server has placed in the room's log.
///
/// `version` starts at 1 and is gapless across the room's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerChange {
    #[serde(alias = "identity")]
    pub id: ChangeId,
    pub version: u64,
    pub payload: Value,
}

impl ServerChange {
    pub fn new(id: impl Into<ChangeId>, version: u64, payload: Value) -> Self {
        Self {
            id: id.into(),
            version,
            payload,
        }
    }

    /// View the ordered change as a plain change for the store.
    pub fn to_change(&self) -> Change {
        Change {
            id: self.id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Delivery class of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Queued and retried until acknowledged.
    Durable,
    /// Fire-and-forget; never queued or retried.
    Ephemeral,
}
