//! Durable per-zone sync state.
//!
//! Each zone owns a pending-operation log and a watermark per record type.
//! Both must survive process restart bit-for-bit; neither is ever shared
//! across zones.

use crate::error::{SyncError, SyncResult};
use crate::queue::PendingOperation;
use crate::remote::Watermark;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Queue log file name inside a zone state directory.
const QUEUE_FILE: &str = "pending.ops";
/// Watermark file name inside a zone state directory.
const WATERMARK_FILE: &str = "watermarks.cbor";
/// Advisory lock file name.
const LOCK_FILE: &str = "lock";

/// Current on-disk queue format.
const QUEUE_FORMAT: u32 = 1;

/// Durable home of one zone's pending operations and watermarks.
pub trait SyncStateStore: Send + Sync {
    /// Loads the pending-operation log in enqueue order.
    fn load_queue(&self) -> SyncResult<Vec<PendingOperation>>;

    /// Persists the pending-operation log.
    fn save_queue(&self, ops: &[PendingOperation]) -> SyncResult<()>;

    /// Returns the stored watermark for a record type.
    fn watermark(&self, record_type: &str) -> SyncResult<Option<Watermark>>;

    /// Persists the watermark for a record type.
    fn set_watermark(&self, record_type: &str, watermark: Watermark) -> SyncResult<()>;
}

/// In-memory state store for tests and ephemeral zones.
#[derive(Default)]
pub struct MemoryStateStore {
    queue: Mutex<Vec<PendingOperation>>,
    watermarks: Mutex<BTreeMap<String, u64>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStateStore for MemoryStateStore {
    fn load_queue(&self) -> SyncResult<Vec<PendingOperation>> {
        Ok(self.queue.lock().clone())
    }

    fn save_queue(&self, ops: &[PendingOperation]) -> SyncResult<()> {
        *self.queue.lock() = ops.to_vec();
        Ok(())
    }

    fn watermark(&self, record_type: &str) -> SyncResult<Option<Watermark>> {
        Ok(self.watermarks.lock().get(record_type).map(|&w| Watermark::new(w)))
    }

    fn set_watermark(&self, record_type: &str, watermark: Watermark) -> SyncResult<()> {
        self.watermarks
            .lock()
            .insert(record_type.to_string(), watermark.as_u64());
        Ok(())
    }
}

/// On-disk queue log wrapper, CBOR-encoded.
#[derive(Serialize, Deserialize)]
struct QueueFile {
    format: u32,
    ops: Vec<PendingOperation>,
}

/// File-backed state store: one directory per zone, guarded by an advisory
/// lock, with write-temp-then-rename persistence.
pub struct FileStateStore {
    dir: PathBuf,
    watermarks: Mutex<BTreeMap<String, u64>>,
    // Held open for the store's lifetime to keep the advisory lock.
    _lock: File,
}

impl FileStateStore {
    /// Opens (or creates) a zone state directory.
    ///
    /// Fails if another process holds the zone's lock: sync state is
    /// single-writer per zone.
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| SyncError::state("zone state directory is locked"))?;

        let watermarks = Self::read_watermarks(&dir)?;

        Ok(Self {
            dir,
            watermarks: Mutex::new(watermarks),
            _lock: lock,
        })
    }

    fn read_watermarks(dir: &Path) -> SyncResult<BTreeMap<String, u64>> {
        let path = dir.join(WATERMARK_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(path)?;
        ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| SyncError::state(format!("watermark file unreadable: {e}")))
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> SyncResult<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let path = self.dir.join(name);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl SyncStateStore for FileStateStore {
    fn load_queue(&self) -> SyncResult<Vec<PendingOperation>> {
        let path = self.dir.join(QUEUE_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        let file: QueueFile = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| SyncError::state(format!("queue log unreadable: {e}")))?;
        if file.format != QUEUE_FORMAT {
            return Err(SyncError::state(format!(
                "unsupported queue format {}",
                file.format
            )));
        }
        Ok(file.ops)
    }

    fn save_queue(&self, ops: &[PendingOperation]) -> SyncResult<()> {
        let file = QueueFile {
            format: QUEUE_FORMAT,
            ops: ops.to_vec(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&file, &mut bytes)
            .map_err(|e| SyncError::state(format!("queue log unwritable: {e}")))?;
        self.write_atomic(QUEUE_FILE, &bytes)
    }

    fn watermark(&self, record_type: &str) -> SyncResult<Option<Watermark>> {
        Ok(self
            .watermarks
            .lock()
            .get(record_type)
            .map(|&w| Watermark::new(w)))
    }

    fn set_watermark(&self, record_type: &str, watermark: Watermark) -> SyncResult<()> {
        let snapshot = {
            let mut map = self.watermarks.lock();
            map.insert(record_type.to_string(), watermark.as_u64());
            map.clone()
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&snapshot, &mut bytes)
            .map_err(|e| SyncError::state(format!("watermark file unwritable: {e}")))?;
        self.write_atomic(WATERMARK_FILE, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_codec::RecordKey;

    fn sample_ops() -> Vec<PendingOperation> {
        vec![
            PendingOperation::create(RecordKey::new("DiveLog", "d1"), vec![1, 2, 3], 100),
            PendingOperation::delete(RecordKey::new("DiveLog", "d2"), 200),
        ]
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        let ops = sample_ops();

        store.save_queue(&ops).unwrap();
        assert_eq!(store.load_queue().unwrap(), ops);

        assert_eq!(store.watermark("DiveLog").unwrap(), None);
        store.set_watermark("DiveLog", Watermark::new(42)).unwrap();
        assert_eq!(
            store.watermark("DiveLog").unwrap(),
            Some(Watermark::new(42))
        );
    }

    #[test]
    fn file_store_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ops = sample_ops();

        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store.save_queue(&ops).unwrap();
        }

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_queue().unwrap(), ops);
    }

    #[test]
    fn file_store_watermarks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store.set_watermark("DiveLog", Watermark::new(7)).unwrap();
            store.set_watermark("GearItem", Watermark::new(3)).unwrap();
        }

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.watermark("DiveLog").unwrap(), Some(Watermark::new(7)));
        assert_eq!(
            store.watermark("GearItem").unwrap(),
            Some(Watermark::new(3))
        );
        assert_eq!(store.watermark("Other").unwrap(), None);
    }

    #[test]
    fn empty_store_loads_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        assert!(store.load_queue().unwrap().is_empty());
    }

    #[test]
    fn queue_bytes_are_stable_across_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        let ops = sample_ops();

        store.save_queue(&ops).unwrap();
        let first = fs::read(dir.path().join(QUEUE_FILE)).unwrap();
        store.save_queue(&ops).unwrap();
        let second = fs::read(dir.path().join(QUEUE_FILE)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn zone_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _store = FileStateStore::open(dir.path()).unwrap();

        let second = FileStateStore::open(dir.path());
        assert!(second.is_err());
    }
}
