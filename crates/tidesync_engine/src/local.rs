//! Local store port.
//!
//! The sync engine never queries the device database directly; everything
//! flows through this narrow interface, and every call is a single atomic
//! unit under the store's own transaction discipline. No local transaction
//! is ever held across a network round trip.

use crate::error::SyncResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use tidesync_codec::{DecodedRecord, RecordKey, TransportRecord};

/// A user mutation recorded by the local store.
///
/// `record` carries the post-mutation snapshot; `None` means the record was
/// deleted. Writes performed by the sync engine itself are never reported
/// here, otherwise pulls would echo back as fresh mutations.
#[derive(Debug, Clone)]
pub struct LocalMutation {
    /// The mutated target.
    pub key: RecordKey,
    /// Snapshot after the mutation; absent for deletions.
    pub record: Option<TransportRecord>,
    /// Mutation time in unix milliseconds.
    pub mutated_at: i64,
}

/// Port onto the device-local record store.
pub trait LocalStore: Send + Sync {
    /// Returns user mutations recorded strictly after `cursor` (unix
    /// milliseconds), oldest first. The coordinator ingests these at the
    /// start of every pass; hosts that stage mutations directly through the
    /// coordinator may return an empty list.
    fn load_pending_mutations_since(&self, cursor: i64) -> SyncResult<Vec<LocalMutation>>;

    /// Writes an authoritative or resolved record, overwriting local state.
    fn apply_resolved_record(&self, record: &DecodedRecord) -> SyncResult<()>;

    /// Removes a record deleted remotely.
    fn remove_record(&self, key: &RecordKey) -> SyncResult<()>;

    /// Returns true if the record exists locally.
    fn record_exists(&self, key: &RecordKey) -> SyncResult<bool>;

    /// Reads attachment bytes by relative path, if present on this device.
    fn read_asset(&self, relative_path: &str) -> SyncResult<Option<Vec<u8>>>;
}

/// In-memory local store for tests.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: Mutex<HashMap<(String, String), TransportRecord>>,
    mutations: Mutex<Vec<LocalMutation>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stored record.
    pub fn record(&self, key: &RecordKey) -> Option<TransportRecord> {
        self.records
            .lock()
            .get(&(key.record_type.clone(), key.local_id.clone()))
            .cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Stages a record directly, as the app's optimistic write path would.
    pub fn insert_record(&self, record: TransportRecord) {
        self.records.lock().insert(
            (
                record.record_type().to_string(),
                record.local_id().to_string(),
            ),
            record,
        );
    }

    /// Records a user mutation, as the app's write path would: the record
    /// is stored and the mutation becomes visible to
    /// [`load_pending_mutations_since`](LocalStore::load_pending_mutations_since).
    pub fn record_local_mutation(&self, record: TransportRecord, mutated_at: i64) {
        self.insert_record(record.clone());
        self.mutations.lock().push(LocalMutation {
            key: record.key(),
            record: Some(record),
            mutated_at,
        });
    }

    /// Records a user deletion.
    pub fn record_local_deletion(&self, key: RecordKey, mutated_at: i64) {
        self.records
            .lock()
            .remove(&(key.record_type.clone(), key.local_id.clone()));
        self.mutations.lock().push(LocalMutation {
            key,
            record: None,
            mutated_at,
        });
    }

    /// Stages attachment bytes at a relative path.
    pub fn put_asset(&self, relative_path: impl Into<String>, bytes: Vec<u8>) {
        self.assets.lock().insert(relative_path.into(), bytes);
    }

    /// Snapshot of all records, keyed by `(type, id)`.
    pub fn all_records(&self) -> HashMap<(String, String), TransportRecord> {
        self.records.lock().clone()
    }
}

impl LocalStore for MemoryLocalStore {
    fn load_pending_mutations_since(&self, cursor: i64) -> SyncResult<Vec<LocalMutation>> {
        Ok(self
            .mutations
            .lock()
            .iter()
            .filter(|m| m.mutated_at > cursor)
            .cloned()
            .collect())
    }

    fn apply_resolved_record(&self, record: &DecodedRecord) -> SyncResult<()> {
        // Sync-originated writes bypass the mutation log.
        self.insert_record(record.record.clone());
        Ok(())
    }

    fn remove_record(&self, key: &RecordKey) -> SyncResult<()> {
        self.records
            .lock()
            .remove(&(key.record_type.clone(), key.local_id.clone()));
        Ok(())
    }

    fn record_exists(&self, key: &RecordKey) -> SyncResult<bool> {
        Ok(self
            .records
            .lock()
            .contains_key(&(key.record_type.clone(), key.local_id.clone())))
    }

    fn read_asset(&self, relative_path: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.assets.lock().get(relative_path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(id: &str, updated_at: i64) -> DecodedRecord {
        DecodedRecord::clean(TransportRecord::new("DiveLog", id, updated_at))
    }

    #[test]
    fn apply_overwrites_existing() {
        let store = MemoryLocalStore::new();
        store.apply_resolved_record(&decoded("d1", 1)).unwrap();
        store.apply_resolved_record(&decoded("d1", 2)).unwrap();

        assert_eq!(store.len(), 1);
        let key = RecordKey::new("DiveLog", "d1");
        assert_eq!(store.record(&key).unwrap().updated_at(), 2);
    }

    #[test]
    fn remove_and_exists() {
        let store = MemoryLocalStore::new();
        let key = RecordKey::new("DiveLog", "d1");

        store.apply_resolved_record(&decoded("d1", 1)).unwrap();
        assert!(store.record_exists(&key).unwrap());

        store.remove_record(&key).unwrap();
        assert!(!store.record_exists(&key).unwrap());

        // Removing again is harmless.
        store.remove_record(&key).unwrap();
    }

    #[test]
    fn mutation_log_filters_by_cursor() {
        let store = MemoryLocalStore::new();
        store.record_local_mutation(TransportRecord::new("DiveLog", "d1", 100), 100);
        store.record_local_deletion(RecordKey::new("DiveLog", "d2"), 200);

        assert_eq!(store.load_pending_mutations_since(0).unwrap().len(), 2);
        let late = store.load_pending_mutations_since(100).unwrap();
        assert_eq!(late.len(), 1);
        assert!(late[0].record.is_none());
    }

    #[test]
    fn sync_writes_never_appear_as_mutations() {
        let store = MemoryLocalStore::new();
        store.apply_resolved_record(&decoded("d1", 1)).unwrap();
        assert!(store.load_pending_mutations_since(0).unwrap().is_empty());
    }

    #[test]
    fn asset_lookup() {
        let store = MemoryLocalStore::new();
        store.put_asset("photos/reef.jpg", vec![1, 2, 3]);

        assert_eq!(
            store.read_asset("photos/reef.jpg").unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.read_asset("missing.jpg").unwrap(), None);
    }
}
