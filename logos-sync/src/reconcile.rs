//! Merge server-ordered changes into the optimistic local document.
//!
//! ```text
//!   acknowledged batch (ascending versions)
//!          │
//!          ▼
//!   for each ServerChange
//!              │
//!              ▼
//!   version == cursor + 1 ? ── no ──► abort batch, cursor unchanged, re-pull
//!              │ yes
//!              ▼
//!   id pending locally? ── yes ──► confirm, no apply, advance cursor
//!              │ no
//!              ▼
//!   apply to working state, advance cursor
//!              │
//!              ▼
//!   replay every still-pending local change on top, in queue order
//!              │
//!              ▼
//!   publish once, flush queue
//! ```
//!
//! The reconciler works on a scratch copy of the cursor and defers queue
//! removals until the whole batch has been applied, so a failed batch
//! leaves no trace: nothing published, nothing acknowledged.

use std::collections::HashSet;
use thiserror::Error;

use crate::change::{ChangeId, ServerChange};
use crate::queue::OutgoingQueue;
use crate::store::{ApplyError, DocumentStore};

/// Highest server version fully applied to the local document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionCursor(u64);

impl VersionCursor {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The only version a remote change may carry to be applied next.
    pub fn expected_next(&self) -> u64 {
        self.0 + 1
    }
}

/// Output of a successful batch.
#[derive(Debug, Clone)]
pub struct Reconciled<S> {
    /// State to publish: remote changes plus replayed local ones.
    pub state: S,
    pub version: u64,
    /// Remote changes applied, in order.
    pub applied: Vec<ChangeId>,
    /// Local changes the batch confirmed (removed from the queue).
    pub confirmed: Vec<ChangeId>,
    /// Pending local changes re-applied on top.
    pub replayed: Vec<ChangeId>,
}

/// Why a batch was discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    /// A server change did not directly follow the cursor.
    #[error("Ordering violation: change {id} has version {found}, expected {expected}")]
    OrderingViolation {
        id: ChangeId,
        expected: u64,
        found: u64,
    },
    /// The store refused a remote or replayed change.
    #[error("Apply failed: {0}")]
    Apply(#[from] ApplyError),
}

/// Owner of the version cursor.
#[derive(Debug, Default)]
pub struct Reconciler {
    cursor: VersionCursor,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a known cursor.
    pub fn with_version(version: u64) -> Self {
        Self {
            cursor: VersionCursor::new(version),
        }
    }

    pub fn version(&self) -> u64 {
        self.cursor.get()
    }

    pub fn cursor(&self) -> VersionCursor {
        self.cursor
    }

    /// Merge an acknowledged batch.
    ///
    /// On success the cursor has advanced, confirmed entries are gone from
    /// `queue`, and the returned state is ready to publish. On error the
    /// cursor and queue are exactly as they were before the call.
    pub fn reconcile<S: DocumentStore>(
        &mut self,
        batch: &[ServerChange],
        store: &S,
        queue: &mut OutgoingQueue,
    ) -> Result<Reconciled<S::State>, ReconcileError> {
        let old = self.cursor;
        let mut cursor = old;
        let base = store.current();
        let mut working = base.clone();

        let mut applied = Vec::new();
        let mut confirmed = Vec::new();
        let mut confirmed_set: HashSet<&ChangeId> = HashSet::new();

        for server_change in batch {
            // Confirmations are ordered too: the log has no gaps either way
            if server_change.version != cursor.expected_next() {
                log::warn!(
                    "Change {} arrived at version {} but cursor is {}; discarding batch",
                    server_change.id,
                    server_change.version,
                    cursor.get()
                );
                return Err(ReconcileError::OrderingViolation {
                    id: server_change.id.clone(),
                    expected: cursor.expected_next(),
                    found: server_change.version,
                });
            }

            let pending =
                queue.contains(&server_change.id) && !confirmed_set.contains(&server_change.id);

            if pending {
                // Local state already reflects this edit
                confirmed_set.insert(&server_change.id);
                confirmed.push(server_change.id.clone());
            } else {
                working = store.apply(&server_change.to_change(), &working, &base)?;
                applied.push(server_change.id.clone());
            }
            cursor = VersionCursor::new(server_change.version);
        }

        // Replay pending local edits on top of the confirmed order
        let confirmed_state = working.clone();
        let mut replayed = Vec::new();
        for queued in queue.iter() {
            if confirmed_set.contains(&queued.change.id) {
                continue;
            }
            working = store.apply(&queued.change, &working, &confirmed_state)?;
            replayed.push(queued.change.id.clone());
        }

        for id in &confirmed {
            queue.acknowledge(id);
        }
        self.cursor = cursor;

        log::debug!(
            "Reconciled batch: version {} → {}, {} applied, {} confirmed, {} replayed",
            old.get(),
            cursor.get(),
            applied.len(),
            confirmed.len(),
            replayed.len()
        );

        Ok(Reconciled {
            state: working,
            version: cursor.get(),
            applied,
            confirmed,
            replayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::store::{Entities, MemoryStore, UpdateSink};
    use serde_json::json;

    fn id(s: &str) -> ChangeId {
        ChangeId::from(s)
    }

    fn remote(name: &str, version: u64, entity: &str, value: i64) -> ServerChange {
        ServerChange::new(name, version, json!({ entity: { "v": value } }))
    }

    fn local(name: &str, entity: &str, value: i64) -> Change {
        Change::new(name, json!({ entity: { "v": value } }))
    }

    /// Apply a local edit optimistically, the way the session does.
    fn commit(store: &mut MemoryStore, queue: &mut OutgoingQueue, change: Change) {
        let current = store.current();
        let next = store.apply(&change, &current, &current).unwrap();
        store.publish(next);
        queue.enqueue(change);
    }

    #[test]
    fn test_remote_batch_advances_to_max_version() {
        let store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        let mut rec = Reconciler::new();

        let out = rec
            .reconcile(
                &[remote("a", 1, "e1", 1), remote("b", 2, "e2", 2), remote("c", 3, "e1", 3)],
                &store,
                &mut queue,
            )
            .unwrap();

        assert_eq!(out.version, 3);
        assert_eq!(rec.version(), 3);
        assert_eq!(out.applied, vec![id("a"), id("b"), id("c")]);
        assert_eq!(out.state["e1"].fields["v"], json!(3));
        assert_eq!(out.state["e2"].fields["v"], json!(2));
    }

    #[test]
    fn test_gap_rejects_batch_and_keeps_cursor() {
        let store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        let mut rec = Reconciler::with_version(5);

        let err = rec
            .reconcile(&[remote("x", 7, "e1", 1)], &store, &mut queue)
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::OrderingViolation {
                id: id("x"),
                expected: 6,
                found: 7
            }
        );
        assert_eq!(rec.version(), 5);
        assert_eq!(store.total_applies(), 0);
    }

    #[test]
    fn test_gap_midway_rolls_back_everything() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("mine", "e9", 9));
        let mut rec = Reconciler::new();

        let err = rec.reconcile(
            &[
                remote("a", 1, "e1", 1),
                ServerChange::new("mine", 2, json!({"e9": {"v": 9}})),
                remote("c", 4, "e1", 4),
            ],
            &store,
            &mut queue,
        );

        assert!(matches!(err, Err(ReconcileError::OrderingViolation { found: 4, .. })));
        assert_eq!(rec.version(), 0);
        // The confirmation seen before the gap is not committed
        assert!(queue.contains(&id("mine")));
    }

    #[test]
    fn test_confirmation_ahead_of_cursor_is_violation() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("mine", "e1", 1));
        let mut rec = Reconciler::new();

        let err = rec
            .reconcile(&[ServerChange::new("mine", 5, json!({"e1": {"v": 1}}))], &store, &mut queue)
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::OrderingViolation {
                id: id("mine"),
                expected: 1,
                found: 5
            }
        );
        assert_eq!(rec.version(), 0);
        assert!(queue.contains(&id("mine")));

        // Versions 1..=4 are still required before anything later
        let err = rec.reconcile(&[remote("r6", 6, "e2", 6)], &store, &mut queue);
        assert!(matches!(err, Err(ReconcileError::OrderingViolation { expected: 1, found: 6, .. })));
    }

    #[test]
    fn test_confirmation_behind_cursor_is_violation() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("b", "e1", 1));
        let mut rec = Reconciler::with_version(5);

        let err = rec.reconcile(&[ServerChange::new("b", 3, json!({"e1": {"v": 1}}))], &store, &mut queue);

        assert!(matches!(err, Err(ReconcileError::OrderingViolation { expected: 6, found: 3, .. })));
        assert_eq!(rec.version(), 5);
        assert!(queue.contains(&id("b")));
    }

    #[test]
    fn test_duplicate_remote_version_is_violation() {
        let store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        let mut rec = Reconciler::with_version(2);

        let err = rec.reconcile(&[remote("old", 2, "e1", 0)], &store, &mut queue);
        assert!(matches!(err, Err(ReconcileError::OrderingViolation { expected: 3, found: 2, .. })));
    }

    #[test]
    fn test_local_confirmation_not_reapplied() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("b", "e1", 42));
        let mut rec = Reconciler::with_version(1);

        let out = rec
            .reconcile(
                &[ServerChange::new("b", 2, json!({"e1": {"v": 42}}))],
                &store,
                &mut queue,
            )
            .unwrap();

        assert_eq!(out.confirmed, vec![id("b")]);
        assert!(out.applied.is_empty());
        assert!(out.replayed.is_empty());
        assert!(queue.is_empty());
        assert_eq!(rec.version(), 2);
        // Only the optimistic apply from commit()
        assert_eq!(store.apply_count(&id("b")), 1);
    }

    #[test]
    fn test_pending_changes_replayed_once_on_top() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("p1", "e1", 100));
        commit(&mut store, &mut queue, local("p2", "e2", 200));
        let mut rec = Reconciler::new();

        let out = rec
            .reconcile(&[remote("r1", 1, "e1", 1)], &store, &mut queue)
            .unwrap();

        assert_eq!(out.replayed, vec![id("p1"), id("p2")]);
        assert_eq!(store.apply_count(&id("p1")), 2);
        assert_eq!(store.apply_count(&id("p2")), 2);
        // Local pending edit wins over the remote write to e1
        assert_eq!(out.state["e1"].fields["v"], json!(100));
        assert_eq!(out.state["e2"].fields["v"], json!(200));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_mixed_batch_confirms_and_applies() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("mine", "e1", 5));
        commit(&mut store, &mut queue, local("later", "e3", 7));
        let mut rec = Reconciler::new();

        let out = rec
            .reconcile(
                &[
                    remote("theirs", 1, "e2", 1),
                    ServerChange::new("mine", 2, json!({"e1": {"v": 5}})),
                    remote("theirs2", 3, "e2", 3),
                ],
                &store,
                &mut queue,
            )
            .unwrap();

        assert_eq!(out.version, 3);
        assert_eq!(out.applied, vec![id("theirs"), id("theirs2")]);
        assert_eq!(out.confirmed, vec![id("mine")]);
        assert_eq!(out.replayed, vec![id("later")]);
        assert_eq!(queue.drain_all().len(), 1);
        assert_eq!(out.state["e1"].fields["v"], json!(5));
        assert_eq!(out.state["e2"].fields["v"], json!(3));
    }

    #[test]
    fn test_apply_failure_rolls_back() {
        let store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        let mut rec = Reconciler::new();

        let err = rec.reconcile(
            &[remote("ok", 1, "e1", 1), ServerChange::new("bad", 2, json!("nope"))],
            &store,
            &mut queue,
        );

        assert!(matches!(err, Err(ReconcileError::Apply(_))));
        assert_eq!(rec.version(), 0);
        let published: Entities = store.current();
        assert!(published.is_empty());
    }

    #[test]
    fn test_empty_batch_replays_pending() {
        let mut store = MemoryStore::counting();
        let mut queue = OutgoingQueue::new();
        commit(&mut store, &mut queue, local("p", "e1", 1));
        let mut rec = Reconciler::with_version(4);

        let out = rec.reconcile(&[], &store, &mut queue).unwrap();
        assert_eq!(out.version, 4);
        assert_eq!(out.replayed, vec![id("p")]);
    }
}
