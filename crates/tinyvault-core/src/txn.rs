//! Read snapshots
//!
//! A [`ReadTxn`] pins the last committed version at creation. Everything it
//! reads comes from that version, whatever commits afterwards. Live snapshots
//! are registered so GC keeps the versions they can still reach.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::engine::EngineInner;
use crate::error::{EngineError, EngineResult};
use crate::iter::{EngineIter, IterOptions};
use crate::version::VersionEntry;

/// A key at one version, as seen through a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    version: u64,
    discard_earlier: bool,
}

impl Item {
    pub(crate) fn from_entry(key: &[u8], entry: &VersionEntry) -> Self {
        Self {
            key: key.to_vec(),
            value: entry.value.clone(),
            version: entry.version,
            discard_earlier: entry.discard_earlier,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value bytes, `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    /// This version is the oldest one history exposes.
    pub fn discard_earlier(&self) -> bool {
        self.discard_earlier
    }
}

/// Counts live snapshots per pinned version.
#[derive(Default)]
pub(crate) struct SnapshotRegistry {
    pinned: Mutex<HashMap<u64, usize>>,
}

impl SnapshotRegistry {
    /// Read `committed` and pin it in one step, so GC can never compute a
    /// watermark above a snapshot that is being created.
    pub(crate) fn pin(&self, committed: &AtomicU64) -> u64 {
        let mut pinned = self.pinned.lock();
        let version = committed.load(Ordering::Acquire);
        *pinned.entry(version).or_insert(0) += 1;
        version
    }

    pub(crate) fn unpin(&self, version: u64) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&version);
            }
        }
    }

    /// Oldest version any live or future snapshot can read.
    pub(crate) fn watermark(&self, committed: &AtomicU64) -> u64 {
        let pinned = self.pinned.lock();
        let current = committed.load(Ordering::Acquire);
        pinned.keys().copied().min().map_or(current, |oldest| oldest.min(current))
    }

    pub(crate) fn live(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}

/// Read-only snapshot of the engine.
pub struct ReadTxn {
    pub(crate) inner: Arc<EngineInner>,
    read_version: u64,
}

impl ReadTxn {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        let read_version = inner.snapshots.pin(&inner.committed);
        Self { inner, read_version }
    }

    /// Version this snapshot reads at.
    pub fn version(&self) -> u64 {
        self.read_version
    }

    /// Newest version of `key` visible to this snapshot. Tombstones are
    /// returned as deleted items so callers can tell "deleted" from "absent".
    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Item>> {
        if self.inner.is_closed() {
            return Err(EngineError::Closed);
        }
        let data = self.inner.data.read();
        Ok(data
            .get(key)
            .and_then(|chain| chain.latest_at(self.read_version))
            .map(|entry| Item::from_entry(key, entry)))
    }

    /// Live value of `key`, skipping tombstones.
    pub fn get_value(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.and_then(Item::into_value))
    }

    pub fn iter(&self, options: IterOptions) -> EngineIter<'_> {
        EngineIter::new(self, options)
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.inner.snapshots.unpin(self.read_version);
    }
}
