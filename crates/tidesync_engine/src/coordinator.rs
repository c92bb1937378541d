//! Sync coordinator.
//!
//! Orchestrates one full synchronization pass per zone: drains the pending
//! operation queue through the remote client, routes version conflicts to
//! the resolver, pulls remote changes since the stored watermark, and
//! persists state only after fully-completed steps. Holds every
//! collaborator by explicit reference; nothing is looked up ambiently.

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::queue::{now_millis, OpKind, PendingOperation, PendingQueue};
use crate::remote::{RemoteChange, RemoteStore};
use crate::store::SyncStateStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Instant;
use tidesync_codec::{
    DecodedRecord, FieldCipher, RecordCodec, RecordKey, TransportRecord, VersionToken, Zone,
};

/// Coordinator state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing in flight.
    Idle,
    /// A pass is running.
    Syncing,
    /// The last pass failed unrecoverably; cleared by the next trigger.
    Error(String),
}

/// Events driving the coordinator's run loop.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Run a sync pass. The optional record type is a latency hint from the
    /// push-notification transport; a pass always covers all types.
    Trigger(Option<String>),
    /// Key material became available; deferred encrypted-field work should
    /// be re-attempted.
    KeyAvailable,
    /// Stop the run loop.
    Shutdown,
}

/// Cheap cloneable sender half for triggering sync.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: Sender<SyncEvent>,
}

impl SyncHandle {
    /// Requests a sync pass.
    pub fn trigger_sync(&self) {
        let _ = self.tx.send(SyncEvent::Trigger(None));
    }

    /// Requests a sync pass, hinting at the record type that changed.
    pub fn trigger_sync_for(&self, record_type: impl Into<String>) {
        let _ = self.tx.send(SyncEvent::Trigger(Some(record_type.into())));
    }

    /// Signals that key material became available.
    pub fn notify_key_available(&self) {
        let _ = self.tx.send(SyncEvent::KeyAvailable);
    }

    /// Stops the run loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SyncEvent::Shutdown);
    }
}

/// Creates the event channel for a coordinator run loop.
pub fn event_channel() -> (SyncHandle, Receiver<SyncEvent>) {
    let (tx, rx) = mpsc::channel();
    (SyncHandle { tx }, rx)
}

/// A permanently failed operation, reported once.
#[derive(Debug, Clone)]
pub struct FailedOperation {
    /// The target that failed.
    pub key: RecordKey,
    /// Why it failed.
    pub message: String,
}

/// Aggregate result of one sync pass. Individual operation and field
/// failures never abort a pass; they are counted here instead.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    /// Operations confirmed by the remote store (pushes and deletes).
    pub pushed: usize,
    /// Remote changes applied to the local store (saves and deletions).
    pub pulled: usize,
    /// Version conflicts resolved automatically.
    pub resolved_conflicts: usize,
    /// Operations left queued awaiting key material.
    pub deferred_ops: usize,
    /// Pulled fields deferred for lack of key material.
    pub deferred_fields: usize,
    /// Pulled fields dropped as corrupt.
    pub corrupt_fields: usize,
    /// Transient failures; the affected work stays queued.
    pub transient_failures: usize,
    /// Permanently failed operations, dropped from the queue.
    pub failed: Vec<FailedOperation>,
    /// The remote reported quota exhaustion; back off longer.
    pub quota_exhausted: bool,
    /// The pass was cancelled between operations.
    pub cancelled: bool,
    /// The remote was unreachable; the queue was not consumed.
    pub skipped_unreachable: bool,
}

impl PassSummary {
    /// Returns true if every piece of work succeeded or was skipped cleanly.
    pub fn is_clean(&self) -> bool {
        self.transient_failures == 0
            && self.failed.is_empty()
            && !self.quota_exhausted
            && !self.cancelled
            && !self.skipped_unreachable
    }
}

/// Result of one network operation, applied to engine state afterwards so
/// no lock is held across a round trip.
enum OpOutcome {
    Pushed(VersionToken, TransportRecord),
    DeletedRemote,
    Conflict(Option<Box<TransportRecord>>, TransportRecord),
    DeferredKey,
    Failed(SyncError),
}

/// Per-zone sync coordinator.
///
/// Only one pass runs at a time; a trigger arriving mid-pass coalesces into
/// a run-again flag instead of a parallel pass, so a queued operation can
/// never be pushed twice.
pub struct SyncCoordinator<R, L, S> {
    zone: Zone,
    config: SyncConfig,
    codec: Arc<RecordCodec>,
    cipher: Arc<dyn FieldCipher>,
    resolver: ConflictResolver,
    remote: Arc<R>,
    local: Arc<L>,
    store: Arc<S>,
    queue: Mutex<PendingQueue>,
    state: RwLock<CoordinatorState>,
    run_again: AtomicBool,
    cancelled: AtomicBool,
    zone_ready: AtomicBool,
    subscribed: Mutex<HashSet<String>>,
    deferred_pulls: Mutex<HashSet<RecordKey>>,
    mutation_cursor: Mutex<i64>,
    last_completed: Mutex<Option<Instant>>,
}

impl<R, L, S> SyncCoordinator<R, L, S>
where
    R: RemoteStore,
    L: LocalStore,
    S: SyncStateStore,
{
    /// Creates a coordinator, restoring the pending queue from the state
    /// store.
    pub fn new(
        zone: Zone,
        config: SyncConfig,
        codec: Arc<RecordCodec>,
        cipher: Arc<dyn FieldCipher>,
        remote: Arc<R>,
        local: Arc<L>,
        store: Arc<S>,
    ) -> SyncResult<Self> {
        let queue = PendingQueue::from_entries(store.load_queue()?);
        let resolver = ConflictResolver::new(Arc::clone(&codec));
        Ok(Self {
            zone,
            config,
            codec,
            cipher,
            resolver,
            remote,
            local,
            store,
            queue: Mutex::new(queue),
            state: RwLock::new(CoordinatorState::Idle),
            run_again: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            zone_ready: AtomicBool::new(false),
            subscribed: Mutex::new(HashSet::new()),
            deferred_pulls: Mutex::new(HashSet::new()),
            mutation_cursor: Mutex::new(0),
            last_completed: Mutex::new(None),
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> CoordinatorState {
        self.state.read().clone()
    }

    /// Returns the completion time of the last successful pass.
    pub fn last_completed(&self) -> Option<Instant> {
        *self.last_completed.lock()
    }

    /// Number of queued, unconfirmed operations.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of the pending queue in enqueue order.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().snapshot()
    }

    /// Requests cooperative cancellation of the running pass. Takes effect
    /// between discrete operations; completed steps stay confirmed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Queues a local mutation of a record.
    ///
    /// The caller has already applied the mutation optimistically to the
    /// local store; the snapshot captured here is what eventually reaches
    /// the remote. A record without a version token has never been synced
    /// and queues as a create.
    pub fn stage_record(&self, record: &TransportRecord) -> SyncResult<()> {
        let payload = record.encode()?;
        let op = if record.version().is_some() {
            PendingOperation::update(record.key(), payload, now_millis())
        } else {
            PendingOperation::create(record.key(), payload, now_millis())
        };
        self.enqueue(op)
    }

    /// Queues a local deletion.
    pub fn stage_delete(&self, key: RecordKey) -> SyncResult<()> {
        self.enqueue(PendingOperation::delete(key, now_millis()))
    }

    /// Enqueues a pending operation and persists the queue.
    pub fn enqueue(&self, op: PendingOperation) -> SyncResult<()> {
        let snapshot = {
            let mut queue = self.queue.lock();
            queue.enqueue(op);
            queue.snapshot()
        };
        self.store.save_queue(&snapshot)
    }

    /// Runs one synchronization pass.
    ///
    /// A pass requested while one is already running sets the run-again
    /// flag and returns [`SyncError::SyncInProgress`].
    pub fn sync_pass(&self) -> SyncResult<PassSummary> {
        if !self.try_begin() {
            self.run_again.store(true, Ordering::SeqCst);
            return Err(SyncError::SyncInProgress);
        }

        let result = self.run_pass();
        match &result {
            Ok(summary) => {
                *self.state.write() = CoordinatorState::Idle;
                if !summary.skipped_unreachable {
                    *self.last_completed.lock() = Some(Instant::now());
                }
                tracing::info!(
                    zone = %self.zone,
                    pushed = summary.pushed,
                    pulled = summary.pulled,
                    conflicts = summary.resolved_conflicts,
                    deferred = summary.deferred_ops,
                    failed = summary.failed.len(),
                    "sync pass complete"
                );
            }
            Err(e) => {
                tracing::error!(zone = %self.zone, error = %e, "sync pass failed");
                *self.state.write() = CoordinatorState::Error(e.to_string());
            }
        }
        result
    }

    fn try_begin(&self) -> bool {
        let mut state = self.state.write();
        if *state == CoordinatorState::Syncing {
            return false;
        }
        *state = CoordinatorState::Syncing;
        true
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn run_pass(&self) -> SyncResult<PassSummary> {
        self.cancelled.store(false, Ordering::SeqCst);
        let mut summary = PassSummary::default();

        // Mutations the local store recorded since the last pass become
        // queued intents before anything else; they are durable even if
        // the remote turns out to be unreachable.
        self.ingest_local_mutations()?;

        // An unreachable remote must not consume the queue: nothing may be
        // reported as confirmed that the remote never saw.
        if !self.remote.is_reachable() {
            tracing::debug!(zone = %self.zone, "remote unreachable, staying idle");
            summary.skipped_unreachable = true;
            return Ok(summary);
        }

        if !self.zone_ready.load(Ordering::SeqCst) {
            self.remote.ensure_zone(&self.zone)?;
            self.zone_ready.store(true, Ordering::SeqCst);
        }

        self.ensure_subscriptions();
        self.drain_queue(&mut summary)?;

        if !summary.quota_exhausted && !summary.cancelled {
            self.pull_changes(&mut summary)?;
        }

        Ok(summary)
    }

    /// Stages mutations the local store recorded since the last ingest.
    ///
    /// Coalescing makes a re-ingest after restart harmless: an already
    /// queued intent for the same target simply absorbs the snapshot.
    fn ingest_local_mutations(&self) -> SyncResult<()> {
        let cursor = *self.mutation_cursor.lock();
        let mutations = self.local.load_pending_mutations_since(cursor)?;
        if mutations.is_empty() {
            return Ok(());
        }

        let mut newest = cursor;
        for mutation in mutations {
            newest = newest.max(mutation.mutated_at);
            match mutation.record {
                Some(record) => self.stage_record(&record)?,
                None => self.stage_delete(mutation.key)?,
            }
        }
        *self.mutation_cursor.lock() = newest;
        Ok(())
    }

    /// Best-effort change subscriptions; failure only costs latency.
    fn ensure_subscriptions(&self) {
        let mut subscribed = self.subscribed.lock();
        for record_type in &self.config.record_types {
            if subscribed.contains(record_type) {
                continue;
            }
            match self.remote.subscribe_to_changes(&self.zone, record_type) {
                Ok(()) => {
                    subscribed.insert(record_type.clone());
                }
                Err(e) => {
                    tracing::warn!(%record_type, error = %e, "subscription failed, polling instead");
                }
            }
        }
    }

    /// Drains the pending queue through the remote client.
    ///
    /// Distinct targets fan out across a bounded worker pool; operations
    /// for the same target stay strictly sequential. Outcomes are applied
    /// to queue and local store afterwards, in enqueue order.
    fn drain_queue(&self, summary: &mut PassSummary) -> SyncResult<()> {
        let snapshot = self.queue.lock().snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }

        // Indices per target, preserving enqueue order within each target.
        let mut target_order: Vec<RecordKey> = Vec::new();
        let mut by_target: HashMap<RecordKey, Vec<usize>> = HashMap::new();
        for (index, op) in snapshot.iter().enumerate() {
            let key = op.key();
            by_target
                .entry(key.clone())
                .or_insert_with(|| {
                    target_order.push(key);
                    Vec::new()
                })
                .push(index);
        }

        let targets: Vec<&[usize]> = target_order
            .iter()
            .map(|key| by_target[key].as_slice())
            .collect();

        let next_target = AtomicUsize::new(0);
        let stop_all = AtomicBool::new(false);
        let outcomes: Mutex<Vec<(usize, OpOutcome)>> = Mutex::new(Vec::new());

        let workers = self.config.push_fan_out.min(targets.len()).max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if stop_all.load(Ordering::SeqCst) || self.is_cancelled() {
                        break;
                    }
                    let t = next_target.fetch_add(1, Ordering::SeqCst);
                    let Some(indices) = targets.get(t) else {
                        break;
                    };
                    for &index in *indices {
                        let outcome = self.execute_op(&snapshot[index]);
                        if let OpOutcome::Failed(e) = &outcome {
                            if e.is_quota() {
                                stop_all.store(true, Ordering::SeqCst);
                            }
                        }
                        let blocks_target =
                            matches!(&outcome, OpOutcome::Failed(e) if e.is_retryable());
                        outcomes.lock().push((index, outcome));
                        if blocks_target {
                            // Same-target order must hold: leave the rest
                            // of this target queued for the next pass.
                            break;
                        }
                    }
                });
            }
        });

        if self.is_cancelled() {
            summary.cancelled = true;
        }

        let mut outcomes = outcomes.into_inner();
        outcomes.sort_by_key(|(index, _)| *index);
        for (index, outcome) in outcomes {
            self.apply_outcome(&snapshot[index], outcome, summary);
        }

        let queue_snapshot = self.queue.lock().snapshot();
        self.store.save_queue(&queue_snapshot)?;
        Ok(())
    }

    /// Runs the network side of one operation. No engine locks are held.
    fn execute_op(&self, op: &PendingOperation) -> OpOutcome {
        match op.kind {
            OpKind::Delete => match self.remote.delete(&self.zone, &op.record_type, &op.local_id)
            {
                Ok(()) => OpOutcome::DeletedRemote,
                Err(e) => OpOutcome::Failed(e),
            },
            OpKind::Create | OpKind::Update => {
                let Some(payload) = &op.payload else {
                    return OpOutcome::Failed(SyncError::permanent("operation has no payload"));
                };
                let plain = match TransportRecord::decode(payload) {
                    Ok(record) => record,
                    Err(e) => {
                        return OpOutcome::Failed(SyncError::permanent(format!(
                            "queued payload unreadable: {e}"
                        )));
                    }
                };

                let sealed = match self.codec.encode(&plain, self.cipher.as_ref()) {
                    Ok(sealed) => sealed,
                    Err(e) => return OpOutcome::Failed(e.into()),
                };
                if !sealed.is_complete() {
                    // Encrypted fields cannot travel without key material
                    // and a partial push would overwrite remote data, so
                    // the whole operation waits.
                    return OpOutcome::DeferredKey;
                }

                if let Err(e) = self.upload_assets(&plain) {
                    return OpOutcome::Failed(e);
                }

                match self.remote.push(&self.zone, &sealed.record) {
                    Ok(token) => OpOutcome::Pushed(token, plain),
                    Err(SyncError::VersionConflict { current }) => {
                        OpOutcome::Conflict(current, plain)
                    }
                    Err(e) => OpOutcome::Failed(e),
                }
            }
        }
    }

    /// Uploads attachments referenced by a record before the record itself.
    fn upload_assets(&self, record: &TransportRecord) -> SyncResult<()> {
        for asset in record.asset_refs() {
            match self.local.read_asset(&asset.relative_path)? {
                Some(bytes) => self.remote.upload_asset(&self.zone, asset, &bytes)?,
                None => {
                    tracing::warn!(
                        path = %asset.relative_path,
                        "referenced asset missing locally, pushing record without upload"
                    );
                }
            }
        }
        Ok(())
    }

    fn apply_outcome(&self, op: &PendingOperation, outcome: OpOutcome, summary: &mut PassSummary) {
        match outcome {
            OpOutcome::Pushed(token, mut plain) => {
                if self.queue.lock().confirm(op.id, op.revision) {
                    plain.set_version(Some(token));
                    if let Err(e) = self
                        .local
                        .apply_resolved_record(&DecodedRecord::clean(plain))
                    {
                        tracing::warn!(record = %op.key(), error = %e, "local version update failed");
                        summary.transient_failures += 1;
                    }
                    summary.pushed += 1;
                }
            }
            OpOutcome::DeletedRemote => {
                if self.queue.lock().confirm(op.id, op.revision) {
                    summary.pushed += 1;
                }
            }
            OpOutcome::Conflict(current, plain) => {
                self.resolve_conflict(op, plain, current, summary);
            }
            OpOutcome::DeferredKey => {
                summary.deferred_ops += 1;
            }
            OpOutcome::Failed(e) => self.record_failure(op, e, summary),
        }
    }

    fn record_failure(&self, op: &PendingOperation, error: SyncError, summary: &mut PassSummary) {
        match error {
            SyncError::QuotaExceeded => {
                tracing::warn!(record = %op.key(), "quota exceeded, backing off");
                summary.quota_exhausted = true;
            }
            e if e.is_retryable() => {
                tracing::warn!(record = %op.key(), error = %e, "transient failure, keeping queued");
                summary.transient_failures += 1;
            }
            SyncError::Cancelled => {
                summary.cancelled = true;
            }
            e => {
                // Permanent: drop the intent but keep the user's data in
                // the local store and report the failure once.
                tracing::error!(record = %op.key(), error = %e, "permanent failure, dropping operation");
                self.queue.lock().confirm(op.id, op.revision);
                summary.failed.push(FailedOperation {
                    key: op.key(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Resolves a reported version conflict and applies the outcome.
    fn resolve_conflict(
        &self,
        op: &PendingOperation,
        local_plain: TransportRecord,
        current: Option<Box<TransportRecord>>,
        summary: &mut PassSummary,
    ) {
        // The conflict may arrive without the authoritative copy.
        let remote_record = match current {
            Some(record) => Some(*record),
            None => match self
                .remote
                .fetch(&self.zone, &op.record_type, &op.local_id)
            {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(record = %op.key(), error = %e, "conflict fetch failed");
                    summary.transient_failures += 1;
                    return;
                }
            },
        };

        let Some(remote_record) = remote_record else {
            // Deleted remotely since our snapshot: re-create, losing nothing.
            let mut fresh = local_plain;
            fresh.set_version(None);
            self.force_push(op, fresh, summary);
            return;
        };

        let resolution =
            match self
                .resolver
                .resolve(&local_plain, &remote_record, self.cipher.as_ref())
            {
                Ok(resolution) => resolution,
                Err(e) => {
                    self.record_failure(op, e, summary);
                    return;
                }
            };

        match resolution {
            Resolution::LocalWins(winner) => {
                self.force_push(op, winner, summary);
            }
            Resolution::RemoteWins(decoded) | Resolution::Merged(decoded) => {
                if self.queue.lock().confirm(op.id, op.revision) {
                    self.track_decode(&decoded, summary);
                    if let Err(e) = self.local.apply_resolved_record(&decoded) {
                        tracing::warn!(record = %op.key(), error = %e, "applying resolution failed");
                        summary.transient_failures += 1;
                        return;
                    }
                    summary.resolved_conflicts += 1;
                }
                // When the entry was superseded mid-flight, the newer local
                // intent pushes (and re-resolves) on the next pass.
            }
        }
    }

    /// Pushes a conflict winner with the remote's newest token.
    fn force_push(&self, op: &PendingOperation, winner: TransportRecord, summary: &mut PassSummary) {
        let sealed = match self.codec.encode(&winner, self.cipher.as_ref()) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.record_failure(op, e.into(), summary);
                return;
            }
        };
        if !sealed.is_complete() {
            summary.deferred_ops += 1;
            return;
        }

        match self.remote.push(&self.zone, &sealed.record) {
            Ok(token) => {
                if self.queue.lock().confirm(op.id, op.revision) {
                    let mut confirmed = winner;
                    confirmed.set_version(Some(token));
                    if let Err(e) = self
                        .local
                        .apply_resolved_record(&DecodedRecord::clean(confirmed))
                    {
                        tracing::warn!(record = %op.key(), error = %e, "local version update failed");
                        summary.transient_failures += 1;
                    }
                    summary.resolved_conflicts += 1;
                }
            }
            Err(SyncError::VersionConflict { .. }) => {
                // The remote advanced again mid-resolution. Leave the
                // operation queued; the next pass resolves against the
                // newer copy.
                tracing::debug!(record = %op.key(), "remote advanced during resolution, retrying later");
                summary.transient_failures += 1;
            }
            Err(e) => self.record_failure(op, e, summary),
        }
    }

    /// Pulls remote changes for every configured record type, paging each
    /// type to exhaustion before persisting its watermark.
    fn pull_changes(&self, summary: &mut PassSummary) -> SyncResult<()> {
        for record_type in &self.config.record_types {
            if self.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            let since = self
                .store
                .watermark(record_type)?
                .unwrap_or_else(crate::remote::Watermark::zero);
            let mut page = None;

            loop {
                if self.is_cancelled() {
                    // Cancellation between pages: the watermark stays at the
                    // last fully-completed sequence.
                    summary.cancelled = true;
                    return Ok(());
                }

                let result = self.remote.fetch_changes(
                    &self.zone,
                    record_type,
                    since,
                    page,
                    self.config.pull_page_size,
                );
                let batch = match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        // A failed or partial page sequence never advances
                        // the watermark.
                        tracing::warn!(%record_type, error = %e, "change fetch failed");
                        if e.is_quota() {
                            summary.quota_exhausted = true;
                            return Ok(());
                        }
                        summary.transient_failures += 1;
                        break;
                    }
                };

                for change in batch.changes {
                    self.apply_remote_change(change, summary);
                }

                match batch.next_page {
                    Some(next) => page = Some(next),
                    None => {
                        self.store.set_watermark(record_type, batch.next_watermark)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_remote_change(&self, change: RemoteChange, summary: &mut PassSummary) {
        let key = change.key();

        // Unconfirmed local intent takes precedence until drained; a pull
        // must not clobber an edit that has not reached the remote yet.
        if self.queue.lock().pending_for(&key) {
            tracing::debug!(record = %key, "skipping pulled change, local intent pending");
            return;
        }

        match change {
            RemoteChange::Deleted(key) => match self.local.remove_record(&key) {
                Ok(()) => summary.pulled += 1,
                Err(e) => {
                    tracing::warn!(record = %key, error = %e, "local delete failed");
                    summary.transient_failures += 1;
                }
            },
            RemoteChange::Saved(record) => {
                let decoded = match self.codec.decode(&record, self.cipher.as_ref()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::error!(record = %key, error = %e, "pulled record undecodable");
                        summary.failed.push(FailedOperation {
                            key,
                            message: e.to_string(),
                        });
                        return;
                    }
                };
                self.track_decode(&decoded, summary);
                match self.local.apply_resolved_record(&decoded) {
                    Ok(()) => summary.pulled += 1,
                    Err(e) => {
                        tracing::warn!(record = %key, error = %e, "local apply failed");
                        summary.transient_failures += 1;
                    }
                }
            }
        }
    }

    /// Accounts for field-level decode degradations and remembers records
    /// to re-fetch once key material arrives.
    fn track_decode(&self, decoded: &DecodedRecord, summary: &mut PassSummary) {
        summary.deferred_fields += decoded.deferred.len();
        summary.corrupt_fields += decoded.corrupt.len();
        if !decoded.deferred.is_empty() {
            self.deferred_pulls.lock().insert(decoded.record.key());
        }
        for field in &decoded.corrupt {
            tracing::warn!(record = %decoded.record.key(), %field, "corrupt field dropped");
        }
    }

    /// Re-fetches records whose encrypted fields were deferred, after key
    /// material becomes available. Returns how many records recovered.
    pub fn retry_deferred(&self) -> usize {
        let keys: Vec<RecordKey> = self.deferred_pulls.lock().iter().cloned().collect();
        let mut recovered = 0;

        for key in keys {
            match self.remote.fetch(&self.zone, &key.record_type, &key.local_id) {
                Ok(Some(record)) => {
                    let Ok(decoded) = self.codec.decode(&record, self.cipher.as_ref()) else {
                        continue;
                    };
                    if decoded.deferred.is_empty()
                        && self.local.apply_resolved_record(&decoded).is_ok()
                    {
                        self.deferred_pulls.lock().remove(&key);
                        recovered += 1;
                    }
                }
                Ok(None) => {
                    // Gone remotely; nothing left to recover.
                    self.deferred_pulls.lock().remove(&key);
                }
                Err(e) => {
                    tracing::warn!(record = %key, error = %e, "deferred re-fetch failed");
                }
            }
        }

        if recovered > 0 {
            tracing::info!(zone = %self.zone, recovered, "deferred encrypted fields recovered");
        }
        recovered
    }

    /// Event-driven run loop.
    ///
    /// Consumes triggers from the push-notification transport (or any
    /// caller holding a [`SyncHandle`]); when a poll interval is
    /// configured, its expiry acts as a trigger. Triggers that pile up
    /// while a pass runs collapse into a single follow-up pass. After
    /// retryable failures the next automatic pass waits out an exponential
    /// backoff, with the quota floor enforced when the remote asked for
    /// breathing room.
    pub fn run(&self, events: &Receiver<SyncEvent>) {
        let mut attempt: u32 = 0;
        let mut next_wait = self.config.poll_interval;

        loop {
            let event = match next_wait {
                Some(wait) => match events.recv_timeout(wait) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => SyncEvent::Trigger(None),
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match events.recv() {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };

            match event {
                SyncEvent::Shutdown => return,
                SyncEvent::KeyAvailable => {
                    self.retry_deferred();
                }
                SyncEvent::Trigger(_) => {}
            }

            // Collapse whatever queued up while we were busy.
            loop {
                match events.try_recv() {
                    Ok(SyncEvent::Shutdown) => return,
                    Ok(SyncEvent::KeyAvailable) => {
                        self.retry_deferred();
                    }
                    Ok(SyncEvent::Trigger(_)) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let outcome = self.sync_pass();
            while self.run_again.swap(false, Ordering::SeqCst) {
                let _ = self.sync_pass();
            }

            next_wait = match &outcome {
                Ok(summary) if summary.quota_exhausted => {
                    attempt += 1;
                    Some(
                        self.config
                            .retry
                            .delay_for_attempt(attempt)
                            .max(self.config.quota_backoff_floor),
                    )
                }
                Ok(summary)
                    if summary.transient_failures > 0
                        && attempt + 1 < self.config.retry.max_attempts =>
                {
                    attempt += 1;
                    Some(self.config.retry.delay_for_attempt(attempt))
                }
                Ok(_) => {
                    attempt = 0;
                    self.config.poll_interval
                }
                Err(SyncError::SyncInProgress) => self.config.poll_interval,
                Err(_) => {
                    attempt += 1;
                    if attempt < self.config.retry.max_attempts {
                        Some(self.config.retry.delay_for_attempt(attempt))
                    } else {
                        self.config.poll_interval
                    }
                }
            };
        }
    }
}
