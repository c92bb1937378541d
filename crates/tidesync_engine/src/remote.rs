//! Remote store client port.
//!
//! Abstracts the authoritative backend behind create/update/delete/fetch/
//! batch/subscribe operations, independent of its wire protocol. Every
//! operation is independently retryable and subject to the configured
//! per-operation timeout (a timeout surfaces as `SyncError::Timeout`,
//! which classifies as transient).

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tidesync_codec::{AssetRef, RecordKey, TransportRecord, VersionToken, Zone};

/// Cursor of the last successfully pulled remote change for one
/// `(zone, record type)`. Non-decreasing across successful pulls; never
/// advanced by a failed or partial page sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Watermark(u64);

impl Watermark {
    /// The watermark before any pull has happened.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Creates a watermark from its raw cursor value.
    pub fn new(cursor: u64) -> Self {
        Self(cursor)
    }

    /// Returns the raw cursor value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Opaque continuation token inside one paginated change fetch.
///
/// Distinct from [`Watermark`] so an unfinished page sequence can never be
/// persisted as progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor(pub(crate) u64);

/// One change pulled from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// A record was created or updated; carries the authoritative copy.
    Saved(TransportRecord),
    /// A record was deleted remotely.
    Deleted(RecordKey),
}

impl RemoteChange {
    /// Returns the target identity of this change.
    pub fn key(&self) -> RecordKey {
        match self {
            RemoteChange::Saved(record) => record.key(),
            RemoteChange::Deleted(key) => key.clone(),
        }
    }
}

/// One page of remote changes.
#[derive(Debug, Clone)]
pub struct ChangePage {
    /// The changes in remote commit order.
    pub changes: Vec<RemoteChange>,
    /// Watermark reflecting everything delivered so far in this sequence.
    pub next_watermark: Watermark,
    /// Continuation if more pages remain; the engine pages to exhaustion
    /// before persisting the watermark.
    pub next_page: Option<PageCursor>,
}

/// Client port onto the authoritative remote store.
pub trait RemoteStore: Send + Sync {
    /// Cheap availability probe. When false, a sync pass does not start and
    /// the queue is left untouched.
    fn is_reachable(&self) -> bool;

    /// Creates the zone if needed. Idempotent: "already exists" is success.
    fn ensure_zone(&self, zone: &Zone) -> SyncResult<()>;

    /// Saves a record, using the record's embedded version token for
    /// optimistic concurrency. A stale or missing token against an existing
    /// record yields [`SyncError::VersionConflict`] carrying the current
    /// authoritative copy.
    fn push(&self, zone: &Zone, record: &TransportRecord) -> SyncResult<VersionToken>;

    /// Saves a batch of records, reporting the outcome of every record.
    /// A partial failure is visible per record, never an all-or-nothing
    /// illusion.
    fn push_batch(
        &self,
        zone: &Zone,
        records: &[TransportRecord],
    ) -> Vec<(RecordKey, SyncResult<VersionToken>)> {
        records
            .iter()
            .map(|record| (record.key(), self.push(zone, record)))
            .collect()
    }

    /// Fetches the current authoritative copy of a record.
    fn fetch(
        &self,
        zone: &Zone,
        record_type: &str,
        local_id: &str,
    ) -> SyncResult<Option<TransportRecord>>;

    /// Deletes a record. Deleting an already-absent record is success.
    fn delete(&self, zone: &Zone, record_type: &str, local_id: &str) -> SyncResult<()>;

    /// Fetches changes for a record type since the given watermark,
    /// optionally continuing a paginated sequence.
    fn fetch_changes(
        &self,
        zone: &Zone,
        record_type: &str,
        since: Watermark,
        page: Option<PageCursor>,
        limit: u32,
    ) -> SyncResult<ChangePage>;

    /// Registers for change notifications. Best effort: failure degrades to
    /// polling and never blocks sync correctness.
    fn subscribe_to_changes(&self, zone: &Zone, record_type: &str) -> SyncResult<()>;

    /// Uploads a content-addressed attachment. Re-uploading an existing
    /// digest is success.
    fn upload_asset(&self, zone: &Zone, asset: &AssetRef, bytes: &[u8]) -> SyncResult<()>;
}

fn token_for(version: u64) -> VersionToken {
    VersionToken::from_bytes(version.to_be_bytes().to_vec())
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: TransportRecord,
    version: u64,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    record_type: String,
    local_id: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct ZoneState {
    records: HashMap<(String, String), StoredRecord>,
    log: Vec<LogEntry>,
    assets: HashMap<String, Vec<u8>>,
    subscriptions: HashSet<String>,
    next_version: u64,
    next_seq: u64,
}

impl ZoneState {
    fn log_change(&mut self, record_type: &str, local_id: &str, deleted: bool) -> u64 {
        self.next_seq += 1;
        self.log.push(LogEntry {
            seq: self.next_seq,
            record_type: record_type.to_string(),
            local_id: local_id.to_string(),
            deleted,
        });
        self.next_seq
    }

    fn store(&mut self, record: &TransportRecord) -> u64 {
        self.next_version += 1;
        let version = self.next_version;
        let mut stored = record.clone();
        stored.set_version(Some(token_for(version)));
        self.records.insert(
            (record.record_type().to_string(), record.local_id().to_string()),
            StoredRecord {
                record: stored,
                version,
            },
        );
        self.log_change(record.record_type(), record.local_id(), false);
        version
    }
}

/// In-memory authoritative store with scripted fault injection.
///
/// Used by the engine's own tests and by hosts that want a hermetic sync
/// environment. Version tokens are per-zone counters; the change log keeps
/// remote commit order and paginates with sequence cursors.
#[derive(Default)]
pub struct MemoryRemote {
    zones: Mutex<HashMap<String, ZoneState>>,
    reachable: AtomicBool,
    subscriptions_fail: AtomicBool,
    push_faults: Mutex<VecDeque<SyncError>>,
    delete_faults: Mutex<VecDeque<SyncError>>,
    fetch_faults: Mutex<VecDeque<SyncError>>,
    changes_faults: Mutex<VecDeque<SyncError>>,
    ensure_faults: Mutex<VecDeque<SyncError>>,
    push_calls: AtomicU64,
    delete_calls: AtomicU64,
    change_fetches: AtomicU64,
}

impl MemoryRemote {
    /// Creates a reachable remote with no zones.
    pub fn new() -> Self {
        let remote = Self::default();
        remote.reachable.store(true, Ordering::SeqCst);
        remote
    }

    /// Sets reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes subscription registration fail until reset.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.subscriptions_fail.store(fail, Ordering::SeqCst);
    }

    /// Scripts a failure for the next push.
    pub fn fail_next_push(&self, error: SyncError) {
        self.push_faults.lock().push_back(error);
    }

    /// Scripts a failure for the next delete.
    pub fn fail_next_delete(&self, error: SyncError) {
        self.delete_faults.lock().push_back(error);
    }

    /// Scripts a failure for the next fetch.
    pub fn fail_next_fetch(&self, error: SyncError) {
        self.fetch_faults.lock().push_back(error);
    }

    /// Scripts a failure for the next change fetch.
    pub fn fail_next_changes(&self, error: SyncError) {
        self.changes_faults.lock().push_back(error);
    }

    /// Scripts a failure for the next zone creation.
    pub fn fail_next_ensure(&self, error: SyncError) {
        self.ensure_faults.lock().push_back(error);
    }

    /// Writes a record remote-side, as another device would. Returns the
    /// assigned version token.
    pub fn seed_record(&self, zone: &Zone, record: &TransportRecord) -> VersionToken {
        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        token_for(state.store(record))
    }

    /// Deletes a record remote-side, as another device would.
    pub fn seed_delete(&self, zone: &Zone, record_type: &str, local_id: &str) {
        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        state
            .records
            .remove(&(record_type.to_string(), local_id.to_string()));
        state.log_change(record_type, local_id, true);
    }

    /// Returns the current authoritative copy of a record.
    pub fn record(&self, zone: &Zone, record_type: &str, local_id: &str) -> Option<TransportRecord> {
        self.zones
            .lock()
            .get(zone.as_str())
            .and_then(|s| {
                s.records
                    .get(&(record_type.to_string(), local_id.to_string()))
            })
            .map(|s| s.record.clone())
    }

    /// Returns an uploaded asset by content address.
    pub fn asset(&self, zone: &Zone, sha256_hex: &str) -> Option<Vec<u8>> {
        self.zones
            .lock()
            .get(zone.as_str())
            .and_then(|s| s.assets.get(sha256_hex))
            .cloned()
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone: &Zone) -> bool {
        self.zones.lock().contains_key(zone.as_str())
    }

    /// Returns true if the record type has an active subscription.
    pub fn is_subscribed(&self, zone: &Zone, record_type: &str) -> bool {
        self.zones
            .lock()
            .get(zone.as_str())
            .is_some_and(|s| s.subscriptions.contains(record_type))
    }

    /// Number of push calls served (including failures).
    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls served (including failures).
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of change-fetch calls served.
    pub fn change_fetches(&self) -> u64 {
        self.change_fetches.load(Ordering::SeqCst)
    }

    fn take_fault(faults: &Mutex<VecDeque<SyncError>>) -> Option<SyncError> {
        faults.lock().pop_front()
    }
}

impl RemoteStore for MemoryRemote {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn ensure_zone(&self, zone: &Zone) -> SyncResult<()> {
        if let Some(err) = Self::take_fault(&self.ensure_faults) {
            return Err(err);
        }
        self.zones
            .lock()
            .entry(zone.as_str().to_string())
            .or_default();
        Ok(())
    }

    fn push(&self, zone: &Zone, record: &TransportRecord) -> SyncResult<VersionToken> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::take_fault(&self.push_faults) {
            return Err(err);
        }

        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        let key = (
            record.record_type().to_string(),
            record.local_id().to_string(),
        );

        match state.records.get(&key) {
            None => {
                // A base version against an absent record means the record
                // was deleted remotely since the snapshot was taken.
                if record.version().is_some() {
                    return Err(SyncError::VersionConflict { current: None });
                }
                Ok(token_for(state.store(record)))
            }
            Some(stored) => {
                let base_matches = record
                    .version()
                    .is_some_and(|v| v == &token_for(stored.version));
                if !base_matches {
                    return Err(SyncError::VersionConflict {
                        current: Some(Box::new(stored.record.clone())),
                    });
                }
                Ok(token_for(state.store(record)))
            }
        }
    }

    fn fetch(
        &self,
        zone: &Zone,
        record_type: &str,
        local_id: &str,
    ) -> SyncResult<Option<TransportRecord>> {
        if let Some(err) = Self::take_fault(&self.fetch_faults) {
            return Err(err);
        }
        Ok(self.record(zone, record_type, local_id))
    }

    fn delete(&self, zone: &Zone, record_type: &str, local_id: &str) -> SyncResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::take_fault(&self.delete_faults) {
            return Err(err);
        }

        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        let key = (record_type.to_string(), local_id.to_string());
        if state.records.remove(&key).is_some() {
            state.log_change(record_type, local_id, true);
        }
        // Deleting an absent record is success, not an error.
        Ok(())
    }

    fn fetch_changes(
        &self,
        zone: &Zone,
        record_type: &str,
        since: Watermark,
        page: Option<PageCursor>,
        limit: u32,
    ) -> SyncResult<ChangePage> {
        self.change_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::take_fault(&self.changes_faults) {
            return Err(err);
        }

        let zones = self.zones.lock();
        let Some(state) = zones.get(zone.as_str()) else {
            return Ok(ChangePage {
                changes: Vec::new(),
                next_watermark: since,
                next_page: None,
            });
        };

        let start = page.map_or(since.as_u64(), |c| c.0);
        let mut changes = Vec::new();
        let mut last_seq = start;

        for entry in state
            .log
            .iter()
            .filter(|e| e.record_type == record_type && e.seq > start)
            .take(limit as usize)
        {
            last_seq = entry.seq;
            let key = (entry.record_type.clone(), entry.local_id.clone());
            match state.records.get(&key) {
                Some(stored) if !entry.deleted => {
                    changes.push(RemoteChange::Saved(stored.record.clone()));
                }
                // Deleted, or saved but since removed: the authoritative
                // statement for this target is now absence.
                _ => changes.push(RemoteChange::Deleted(RecordKey::new(
                    entry.record_type.clone(),
                    entry.local_id.clone(),
                ))),
            }
        }

        let has_more = state
            .log
            .iter()
            .any(|e| e.record_type == record_type && e.seq > last_seq);

        Ok(ChangePage {
            changes,
            next_watermark: Watermark::new(last_seq),
            next_page: has_more.then_some(PageCursor(last_seq)),
        })
    }

    fn subscribe_to_changes(&self, zone: &Zone, record_type: &str) -> SyncResult<()> {
        if self.subscriptions_fail.load(Ordering::SeqCst) {
            return Err(SyncError::transient("subscription service unavailable"));
        }
        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        state.subscriptions.insert(record_type.to_string());
        Ok(())
    }

    fn upload_asset(&self, zone: &Zone, asset: &AssetRef, bytes: &[u8]) -> SyncResult<()> {
        let mut zones = self.zones.lock();
        let state = zones.entry(zone.as_str().to_string()).or_default();
        state
            .assets
            .entry(asset.sha256_hex.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }
}
