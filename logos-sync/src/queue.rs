//! Outgoing queue of durable changes awaiting server acknowledgment.
//!
//! One entry per [`ChangeId`]. Enqueuing an id that is already pending
//! replaces its payload but keeps its original position and `queued_at`, so
//! flush order and queue-latency figures reflect when the edit first
//! became pending. Entries leave the queue only through [`OutgoingQueue::acknowledge`]
//! (or [`OutgoingQueue::discard`] when the server rejects them).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::change::{Change, ChangeId};

/// A pending durable change.
#[derive(Debug, Clone)]
pub struct QueuedChange {
    pub change: Change,
    pub queued_at: Instant,
    seq: u64,
}

impl QueuedChange {
    /// Time spent waiting for acknowledgment.
    pub fn age(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// Insertion-ordered, identity-keyed buffer of unacknowledged changes.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    entries: HashMap<ChangeId, QueuedChange>,
    order: BTreeMap<u64, ChangeId>,
    next_seq: u64,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a change, or replace the payload of the pending entry with the
    /// same identity. Returns `true` when the identity was not yet queued.
    pub fn enqueue(&mut self, change: Change) -> bool {
        if let Some(existing) = self.entries.get_mut(&change.id) {
            existing.change = change;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, change.id.clone());
        self.entries.insert(
            change.id.clone(),
            QueuedChange {
                change,
                queued_at: Instant::now(),
                seq,
            },
        );
        true
    }

    /// All pending changes in insertion order. Nothing is removed.
    pub fn drain_all(&self) -> Vec<Change> {
        self.iter().map(|q| q.change.clone()).collect()
    }

    /// Pending entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedChange> + '_ {
        self.order.values().filter_map(|id| self.entries.get(id))
    }

    /// Remove the entry confirmed by the server.
    pub fn acknowledge(&mut self, id: &ChangeId) -> Option<QueuedChange> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    /// Remove entries the server refused; returns the ones that were pending.
    pub fn discard(&mut self, ids: &[ChangeId]) -> Vec<Change> {
        ids.iter()
            .filter_map(|id| self.acknowledge(id))
            .map(|q| q.change)
            .collect()
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ChangeId) -> Option<&QueuedChange> {
        self.entries.get(id)
    }

    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the longest-waiting entry.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.iter().next().map(QueuedChange::age)
    }
}
