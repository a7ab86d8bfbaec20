//! Document store seam.
//!
//! The sync core never interprets change payloads. It asks a
//! [`DocumentStore`] for the current state and to apply a change to a
//! state, and hands finished states to an [`UpdateSink`] in one
//! replacement. [`MemoryStore`] is a small entity-map store used by the
//! probe binary and the tests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::change::{Change, ChangeId};

/// Holder of the document state and of the change semantics.
pub trait DocumentStore {
    type State: Clone;

    /// Current entities, soft-deleted ones included.
    fn current(&self) -> Self::State;

    /// Apply `change` on top of `current`. `base` is the reference state the
    /// change is being merged against; stores without conflict-aware merging
    /// may ignore it.
    fn apply(
        &self,
        change: &Change,
        current: &Self::State,
        base: &Self::State,
    ) -> Result<Self::State, ApplyError>;
}

/// Receiver of full replacement states (UI, renderer, the store itself).
pub trait UpdateSink<S> {
    fn publish(&mut self, state: S);
}

impl<S> UpdateSink<S> for tokio::sync::watch::Sender<S> {
    fn publish(&mut self, state: S) {
        self.send_replace(state);
    }
}

/// A change the store could not apply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("Invalid payload in change {id}: {reason}")]
    InvalidPayload { id: ChangeId, reason: String },
    #[error("Change {id} conflicts: {reason}")]
    Conflict { id: ChangeId, reason: String },
}

/// One entity of a [`MemoryStore`] document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub fields: Map<String, Value>,
    pub deleted: bool,
}

/// Entity set keyed by entity id.
pub type Entities = BTreeMap<String, Entity>;

#[derive(Debug, Default)]
struct MemoryInner {
    entities: Entities,
    /// Per-id apply counts, kept only by [`MemoryStore::counting`] stores
    apply_counts: Option<HashMap<ChangeId, usize>>,
    publishes: u64,
}

/// In-memory entity store.
///
/// Payloads are objects mapping entity ids to a patch: an object of fields
/// merged over the entity (last writer wins), or `null` to soft-delete it.
/// Clones share the same state, so one clone can serve as the store and
/// another as the sink. Apply counting is off unless the store was built
/// with [`MemoryStore::counting`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also counts how often each change id is applied.
    pub fn counting() -> Self {
        let store = Self::default();
        store.write().apply_counts = Some(HashMap::new());
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of a single entity.
    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.read().entities.get(id).cloned()
    }

    /// How many times `id` has been applied. Always 0 without counting.
    pub fn apply_count(&self, id: &ChangeId) -> usize {
        self.read()
            .apply_counts
            .as_ref()
            .and_then(|counts| counts.get(id).copied())
            .unwrap_or(0)
    }

    /// Total applies across all ids. Always 0 without counting.
    pub fn total_applies(&self) -> usize {
        self.read()
            .apply_counts
            .as_ref()
            .map_or(0, |counts| counts.values().sum())
    }

    /// Number of published replacement states.
    pub fn publishes(&self) -> u64 {
        self.read().publishes
    }
}

impl DocumentStore for MemoryStore {
    type State = Entities;

    fn current(&self) -> Entities {
        self.read().entities.clone()
    }

    fn apply(&self, change: &Change, current: &Entities, _base: &Entities) -> Result<Entities, ApplyError> {
        if let Some(counts) = self.write().apply_counts.as_mut() {
            *counts.entry(change.id.clone()).or_default() += 1;
        }

        let patches = change.payload.as_object().ok_or_else(|| ApplyError::InvalidPayload {
            id: change.id.clone(),
            reason: "payload is not an object".into(),
        })?;

        let mut next = current.clone();
        for (entity_id, patch) in patches {
            match patch {
                Value::Null => {
                    next.entry(entity_id.clone()).or_default().deleted = true;
                }
                Value::Object(fields) => {
                    let entity = next.entry(entity_id.clone()).or_default();
                    for (key, value) in fields {
                        entity.fields.insert(key.clone(), value.clone());
                    }
                }
                other => {
                    return Err(ApplyError::InvalidPayload {
                        id: change.id.clone(),
                        reason: format!("patch for {entity_id} is {other}"),
                    });
                }
            }
        }
        Ok(next)
    }
}

impl UpdateSink<Entities> for MemoryStore {
    fn publish(&mut self, state: Entities) {
        let mut inner = self.write();
        inner.entities = state;
        inner.publishes += 1;
    }
}
