//! Pending operation queue.
//!
//! Local mutations are applied optimistically and queued here as durable
//! intents until the remote store confirms them. Operations targeting the
//! same record coalesce in place so each record costs at most one round
//! trip per pass.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tidesync_codec::RecordKey;
use uuid::Uuid;

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Record has never been pushed.
    Create,
    /// Record exists remotely and was mutated locally.
    Update,
    /// Record was deleted locally.
    Delete,
}

/// A durably queued, not-yet-confirmed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Operation identity, distinct from record identity.
    pub id: Uuid,
    /// Target record type.
    pub record_type: String,
    /// Target record id.
    pub local_id: String,
    /// What the mutation intends.
    pub kind: OpKind,
    /// Canonical CBOR snapshot of the plaintext record at enqueue time.
    /// Absent for deletes.
    pub payload: Option<Vec<u8>>,
    /// Enqueue time in unix milliseconds.
    pub enqueued_at: i64,
    /// Incremented every time this entry is coalesced. A confirmation only
    /// removes the entry if the revision still matches, so an edit made
    /// while the push was in flight is never lost.
    pub revision: u64,
}

impl PendingOperation {
    fn new(key: RecordKey, kind: OpKind, payload: Option<Vec<u8>>, enqueued_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_type: key.record_type,
            local_id: key.local_id,
            kind,
            payload,
            enqueued_at,
            revision: 0,
        }
    }

    /// Creates a create operation.
    pub fn create(key: RecordKey, payload: Vec<u8>, enqueued_at: i64) -> Self {
        Self::new(key, OpKind::Create, Some(payload), enqueued_at)
    }

    /// Creates an update operation.
    pub fn update(key: RecordKey, payload: Vec<u8>, enqueued_at: i64) -> Self {
        Self::new(key, OpKind::Update, Some(payload), enqueued_at)
    }

    /// Creates a delete operation.
    pub fn delete(key: RecordKey, enqueued_at: i64) -> Self {
        Self::new(key, OpKind::Delete, None, enqueued_at)
    }

    /// Returns the target identity.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.local_id.clone())
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Queued,
    /// An existing entry for the target absorbed the new intent.
    Coalesced,
    /// A delete cancelled an unconfirmed create; nothing will reach the
    /// remote store for this target.
    Annihilated,
}

/// FIFO queue of pending operations with per-target coalescing.
///
/// # Coalescing rules
///
/// - A newer operation for an already-queued target replaces the queued
///   entry's kind and payload in place, keeping its FIFO position.
/// - A delete over an unconfirmed create removes the entry entirely: the
///   remote store never learns the record existed.
/// - A queued delete is never replaced by a later create; the create queues
///   behind it and drains after the delete confirms.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingOperation>,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the queue from persisted entries, preserving order.
    pub fn from_entries(entries: Vec<PendingOperation>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Enqueues an operation, applying the coalescing rules.
    pub fn enqueue(&mut self, op: PendingOperation) -> EnqueueOutcome {
        let target = op.key();
        let existing = self
            .entries
            .iter()
            .rposition(|e| e.record_type == target.record_type && e.local_id == target.local_id);

        let Some(index) = existing else {
            tracing::debug!(record = %target, kind = ?op.kind, "queued operation");
            self.entries.push_back(op);
            return EnqueueOutcome::Queued;
        };

        let existing_kind = self.entries[index].kind;
        match (existing_kind, op.kind) {
            // A queued delete holds its ground; later creates line up after.
            (OpKind::Delete, OpKind::Create | OpKind::Update) => {
                self.entries.push_back(op);
                EnqueueOutcome::Queued
            }
            // Create that the remote never saw, deleted again: drop both.
            (OpKind::Create, OpKind::Delete) => {
                self.entries.remove(index);
                tracing::debug!(record = %target, "create annihilated by delete");
                EnqueueOutcome::Annihilated
            }
            _ => {
                let entry = &mut self.entries[index];
                entry.kind = op.kind;
                entry.payload = op.payload;
                entry.enqueued_at = op.enqueued_at;
                entry.revision += 1;
                EnqueueOutcome::Coalesced
            }
        }
    }

    /// Removes a confirmed operation.
    ///
    /// Returns false (and keeps the entry) if the entry was coalesced after
    /// the confirmation's snapshot was taken, or if it no longer exists.
    pub fn confirm(&mut self, id: Uuid, revision: u64) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        if self.entries[index].revision != revision {
            tracing::debug!(%id, "confirmation stale, keeping superseded entry");
            return false;
        }
        self.entries.remove(index);
        true
    }

    /// Returns true if any operation targets the given record.
    ///
    /// Pulled remote changes must not overwrite a target with unconfirmed
    /// local intent.
    pub fn pending_for(&self, key: &RecordKey) -> bool {
        self.entries
            .iter()
            .any(|e| e.record_type == key.record_type && e.local_id == key.local_id)
    }

    /// Returns all entries in enqueue order.
    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.entries.iter().cloned().collect()
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> RecordKey {
        RecordKey::new("DiveLog", id)
    }

    #[test]
    fn distinct_targets_queue_in_order() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::create(key("a"), vec![1], 1));
        queue.enqueue(PendingOperation::create(key("b"), vec![2], 2));

        let ops = queue.snapshot();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].local_id, "a");
        assert_eq!(ops[1].local_id, "b");
    }

    #[test]
    fn update_update_delete_coalesces_to_one_delete() {
        let mut queue = PendingQueue::new();
        assert_eq!(
            queue.enqueue(PendingOperation::update(key("a"), vec![1], 1)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(PendingOperation::update(key("a"), vec![2], 2)),
            EnqueueOutcome::Coalesced
        );
        assert_eq!(
            queue.enqueue(PendingOperation::delete(key("a"), 3)),
            EnqueueOutcome::Coalesced
        );

        let ops = queue.snapshot();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Delete);
        assert_eq!(ops[0].payload, None);
    }

    #[test]
    fn create_then_delete_annihilates() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::create(key("a"), vec![1], 1));
        assert_eq!(
            queue.enqueue(PendingOperation::delete(key("a"), 2)),
            EnqueueOutcome::Annihilated
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn coalescing_keeps_fifo_position() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::create(key("a"), vec![1], 1));
        queue.enqueue(PendingOperation::create(key("b"), vec![2], 2));
        queue.enqueue(PendingOperation::update(key("a"), vec![3], 3));

        let ops = queue.snapshot();
        assert_eq!(ops[0].local_id, "a");
        assert_eq!(ops[0].payload, Some(vec![3]));
        assert_eq!(ops[1].local_id, "b");
    }

    #[test]
    fn delete_not_superseded_by_create() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::update(key("a"), vec![1], 1));
        queue.enqueue(PendingOperation::delete(key("a"), 2));
        assert_eq!(
            queue.enqueue(PendingOperation::create(key("a"), vec![3], 3)),
            EnqueueOutcome::Queued
        );

        let ops = queue.snapshot();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::Delete);
        assert_eq!(ops[1].kind, OpKind::Create);
    }

    #[test]
    fn confirm_removes_matching_revision() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::update(key("a"), vec![1], 1));
        let op = queue.snapshot().remove(0);

        assert!(queue.confirm(op.id, op.revision));
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_confirm_keeps_superseded_entry() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::update(key("a"), vec![1], 1));
        let inflight = queue.snapshot().remove(0);

        // User edits again while the push is in flight.
        queue.enqueue(PendingOperation::update(key("a"), vec![2], 2));

        assert!(!queue.confirm(inflight.id, inflight.revision));
        let ops = queue.snapshot();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].payload, Some(vec![2]));
    }

    #[test]
    fn pending_for_matches_target_only() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::update(key("a"), vec![1], 1));

        assert!(queue.pending_for(&key("a")));
        assert!(!queue.pending_for(&key("b")));
        assert!(!queue.pending_for(&RecordKey::new("GearItem", "a")));
    }

    #[test]
    fn persisted_entries_roundtrip_in_order() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PendingOperation::create(key("a"), vec![1], 1));
        queue.enqueue(PendingOperation::delete(key("b"), 2));

        let restored = PendingQueue::from_entries(queue.snapshot());
        assert_eq!(restored.snapshot(), queue.snapshot());
    }
}
