//! Write-ahead log seam.
//!
//! The cursor layer needs three things from the log: append a record
//! version and learn its locator, read a value back by locator after its
//! cached copy was evicted, and store/load full leaf images. [`LogWriter`]
//! is that seam; [`MemLog`] keeps everything in memory.
//!
//! Locators are byte offsets, so they increase with every append and no two
//! writes share one.

use std::collections::HashMap;
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::lock::LockerId;
use crate::lsn::Lsn;
use crate::slot::Slot;

/// Fixed per-entry overhead added to the payload when computing offsets.
const ENTRY_HEADER_BYTES: u64 = 32;

/// Why a version was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryKind {
    /// New record.
    Insert,
    /// Replacement of a live record.
    Update,
    /// Deletion of a live record.
    Delete,
    /// Deletion applied to a leaf delta without reading the full leaf.
    BlindDelete,
    /// Re-write of an unchanged record at a new locator.
    Migrate,
}

/// A record version to append.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    /// Why the version was written.
    pub kind: LogEntryKind,
    /// Owning database.
    pub database: u32,
    /// Record key.
    pub key: &'a [u8],
    /// New value; `None` for deletions.
    pub value: Option<&'a [u8]>,
    /// Locator of the version being replaced.
    pub prior: Lsn,
    /// Transaction that wrote the version, if any.
    pub txn: Option<LockerId>,
    /// Expiration time carried by the version.
    pub expiration: Option<u64>,
}

/// Where and how large an appended version is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedVersion {
    /// Locator of the new version.
    pub lsn: Lsn,
    /// Append sequence number.
    pub seq: u64,
    /// Logged size in bytes.
    pub size: u32,
}

/// Durable storage for record versions and leaf images.
pub trait LogWriter: Send + Sync + StdFmt::Debug {
    /// Append a record version.
    ///
    /// # Errors
    /// [`StoreError::Durability`] if the version could not be made durable.
    fn write_version(&self, entry: &LogEntry<'_>) -> Result<LoggedVersion>;

    /// Value of the version at `lsn`; `None` for a deletion.
    ///
    /// # Errors
    /// [`StoreError::UnexpectedState`] if nothing was logged at `lsn`.
    fn read_value(&self, lsn: Lsn) -> Result<Option<Arc<[u8]>>>;

    /// Append a full leaf image.
    ///
    /// # Errors
    /// [`StoreError::Durability`] if the image could not be made durable.
    fn write_leaf_image(&self, slots: Vec<Slot>) -> Result<Lsn>;

    /// Load a full leaf image.
    ///
    /// # Errors
    /// [`StoreError::UnexpectedState`] if nothing was logged at `lsn`.
    fn read_leaf_image(&self, lsn: Lsn) -> Result<Vec<Slot>>;
}

// ============================================================================
//  MemLog
// ============================================================================

#[derive(Debug)]
enum Record {
    Version { value: Option<Arc<[u8]>> },
    LeafImage { slots: Vec<Slot> },
}

/// Append counters of a [`MemLog`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Record versions appended.
    pub versions: u64,
    /// Leaf images appended.
    pub leaf_images: u64,
    /// Total bytes appended.
    pub bytes: u64,
}

/// In-memory log.
pub struct MemLog {
    records: RwLock<HashMap<Lsn, Record>>,
    next_offset: AtomicU64,
    next_seq: AtomicU64,
    versions: AtomicU64,
    leaf_images: AtomicU64,
    fail_writes: AtomicBool,
}

impl StdFmt::Debug for MemLog {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("MemLog")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_offset: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            versions: AtomicU64::new(0),
            leaf_images: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent append fail with a durability error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Append counters.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        LogStats {
            versions: self.versions.load(Ordering::Relaxed),
            leaf_images: self.leaf_images.load(Ordering::Relaxed),
            bytes: self.next_offset.load(Ordering::Relaxed),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::durability("log writes disabled"));
        }
        Ok(())
    }

    fn append(&self, size: u64, record: Record) -> Lsn {
        let lsn = Lsn::from_raw(self.next_offset.fetch_add(size, Ordering::AcqRel));
        self.records.write().insert(lsn, record);
        lsn
    }
}

impl LogWriter for MemLog {
    fn write_version(&self, entry: &LogEntry<'_>) -> Result<LoggedVersion> {
        self.check_writable()?;
        let payload = entry.key.len() + entry.value.map_or(0, <[u8]>::len);
        let size = ENTRY_HEADER_BYTES + payload as u64;
        let lsn = self.append(
            size,
            Record::Version {
                value: entry.value.map(Arc::from),
            },
        );
        self.versions.fetch_add(1, Ordering::Relaxed);
        Ok(LoggedVersion {
            lsn,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            size: u32::try_from(size).unwrap_or(u32::MAX),
        })
    }

    fn read_value(&self, lsn: Lsn) -> Result<Option<Arc<[u8]>>> {
        match self.records.read().get(&lsn) {
            Some(Record::Version { value }) => Ok(value.clone()),
            Some(Record::LeafImage { .. }) => Err(StoreError::unexpected(format!(
                "{lsn} is a leaf image, not a record version"
            ))),
            None => Err(StoreError::unexpected(format!("no log entry at {lsn}"))),
        }
    }

    fn write_leaf_image(&self, slots: Vec<Slot>) -> Result<Lsn> {
        self.check_writable()?;
        let size = ENTRY_HEADER_BYTES
            + slots
                .iter()
                .map(|s| s.key().len() as u64 + 16)
                .sum::<u64>();
        let lsn = self.append(size, Record::LeafImage { slots });
        self.leaf_images.fetch_add(1, Ordering::Relaxed);
        Ok(lsn)
    }

    fn read_leaf_image(&self, lsn: Lsn) -> Result<Vec<Slot>> {
        match self.records.read().get(&lsn) {
            Some(Record::LeafImage { slots }) => Ok(slots.clone()),
            Some(Record::Version { .. }) => Err(StoreError::unexpected(format!(
                "{lsn} is a record version, not a leaf image"
            ))),
            None => Err(StoreError::unexpected(format!("no log entry at {lsn}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(key: &'a [u8], value: Option<&'a [u8]>) -> LogEntry<'a> {
        LogEntry {
            kind: LogEntryKind::Insert,
            database: 0,
            key,
            value,
            prior: Lsn::NULL,
            txn: None,
            expiration: None,
        }
    }

    #[test]
    fn test_locators_increase() {
        let log = MemLog::new();
        let a = log.write_version(&entry(b"k", Some(b"v1"))).unwrap();
        let b = log.write_version(&entry(b"k", Some(b"v2"))).unwrap();
        assert!(a.lsn < b.lsn);
        assert!(a.seq < b.seq);
        assert_eq!(a.size, 35);
    }

    #[test]
    fn test_read_value_back() {
        let log = MemLog::new();
        let put = log.write_version(&entry(b"k", Some(b"hello"))).unwrap();
        let del = log.write_version(&entry(b"k", None)).unwrap();

        assert_eq!(log.read_value(put.lsn).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(log.read_value(del.lsn).unwrap(), None);
        assert!(log.read_value(Lsn::from_raw(9999)).is_err());
    }

    #[test]
    fn test_leaf_image_round_trip() {
        let log = MemLog::new();
        let lsn = log.write_leaf_image(vec![Slot::new(b"a"), Slot::new(b"b")]).unwrap();
        let image = log.read_leaf_image(lsn).unwrap();
        assert_eq!(image.len(), 2);
        assert!(log.read_value(lsn).is_err());
        assert_eq!(log.stats().leaf_images, 1);
    }

    #[test]
    fn test_failed_writes_are_durability_errors() {
        let log = MemLog::new();
        log.set_fail_writes(true);
        let err = log.write_version(&entry(b"k", None)).unwrap_err();
        assert!(matches!(err, StoreError::Durability { .. }));
        log.set_fail_writes(false);
        assert!(log.write_version(&entry(b"k", None)).is_ok());
    }
}
