//! # TideSync Engine
//!
//! Offline-first record synchronization engine.
//!
//! This crate provides:
//! - A durable, coalescing pending-operation queue
//! - A remote store client port with an in-memory reference implementation
//! - Automatic conflict resolution (last-write-wins, optional field merge)
//! - Per-zone watermark and queue persistence
//! - A sync coordinator state machine driven by an event channel
//!
//! ## Architecture
//!
//! Local mutations are applied optimistically by the host and staged here;
//! the coordinator later drains the queue through the remote client, routes
//! version conflicts to the resolver, then pulls remote changes since the
//! stored watermark and applies them through the local store port.
//!
//! ## Key invariants
//!
//! - One pass per zone at a time; mid-pass triggers coalesce
//! - An operation is removed only after the remote confirms it
//! - A failed or partial page sequence never advances the watermark
//! - Unconfirmed local intent is never clobbered by a pull
//! - Individual operation and field failures never abort a pass

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod coordinator;
mod error;
mod local;
mod queue;
mod remote;
mod store;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::{ConflictResolver, Resolution};
pub use coordinator::{
    event_channel, CoordinatorState, FailedOperation, PassSummary, SyncCoordinator, SyncEvent,
    SyncHandle,
};
pub use error::{SyncError, SyncResult};
pub use local::{LocalMutation, LocalStore, MemoryLocalStore};
pub use queue::{EnqueueOutcome, OpKind, PendingOperation, PendingQueue};
pub use remote::{
    ChangePage, MemoryRemote, PageCursor, RemoteChange, RemoteStore, Watermark,
};
pub use store::{FileStateStore, MemoryStateStore, SyncStateStore};

// Re-export the codec vocabulary that appears in this crate's public API.
pub use tidesync_codec::{
    AssetRef, DecodedRecord, FieldCipher, FieldValue, RecordCodec, RecordKey, RecordSchema,
    SchemaRegistry, TransportRecord, VersionToken, Zone,
};
