//! Core storage engine
//!
//! [`Engine`] keeps an ordered map of version chains in RAM, logs every
//! commit to the WAL before publishing it, and checkpoints the whole map
//! from the GC thread so the log stays short.
//!
//! **Reads**: snapshot at the last committed version, RwLock read side
//! **Writes**: validated, logged, applied, then published by bumping the
//! committed version, all under the WAL mutex
//! **Background**: GC thread prunes history and writes checkpoints

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::batch::{CommitInfo, Mutation, WriteBatch};
use crate::checkpoint::{self, CheckpointInfo, RecordReader, RecordWriter};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::format::{serialize_commit, serialize_entry, Operation};
use crate::gc::{self, GcHandle, GcReport, GcStats};
use crate::txn::{ReadTxn, SnapshotRegistry};
use crate::version::{VersionChain, VersionEntry};
use crate::wal::{WalReader, WalWriter};

/// Keys per read-lock hold while streaming a backup
const BACKUP_PAGE: usize = 1024;

/// State shared by the engine handle, snapshots and the GC thread.
pub(crate) struct EngineInner {
    pub(crate) data: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
    /// Serializes commits and version assignment
    wal: Mutex<WalWriter>,
    /// Serializes checkpoints (GC thread, close, load)
    checkpoint_lock: Mutex<()>,
    /// Last version visible to new snapshots
    pub(crate) committed: AtomicU64,
    pub(crate) snapshots: SnapshotRegistry,
    pub(crate) gc_stats: GcStats,
    pub(crate) config: EngineConfig,
    path: PathBuf,
    closed: AtomicBool,
}

impl EngineInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.path.join("checkpoint")
    }

    fn validate(&self, batch: &WriteBatch) -> EngineResult<()> {
        let ops = batch.len();
        if ops > self.config.max_batch_ops {
            return Err(EngineError::BatchTooLarge { ops, max_ops: self.config.max_batch_ops });
        }
        for mutation in batch.mutations() {
            self.validate_mutation(mutation)?;
        }
        Ok(())
    }

    fn validate_mutation(&self, mutation: &Mutation) -> EngineResult<()> {
        if mutation.key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if mutation.key.len() > self.config.max_key_size {
            return Err(EngineError::OversizedEntry {
                entry_size: mutation.key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        let value_len = mutation.value.as_ref().map_or(0, Vec::len);
        if value_len > self.config.max_value_size {
            return Err(EngineError::OversizedEntry {
                entry_size: value_len as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            });
        }
        Ok(())
    }

    /// Validate, log and publish one batch. Nothing becomes visible unless
    /// the whole batch reached the WAL.
    pub(crate) fn commit(&self, batch: WriteBatch) -> EngineResult<CommitInfo> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.validate(&batch)?;

        let mut wal = self.wal.lock();
        let base = self.committed.load(Ordering::Acquire);
        let info = CommitInfo {
            first_version: base + 1,
            last_version: base + batch.group_count() as u64,
        };

        if !batch.is_empty() {
            let mut buffer = Vec::new();
            for (index, group) in batch.groups().iter().enumerate() {
                let version = info.group_version(index);
                for mutation in group {
                    let (op, value) = match &mutation.value {
                        Some(value) => (Operation::Set, value.as_slice()),
                        None => (Operation::Delete, &[][..]),
                    };
                    serialize_entry(
                        &mut buffer,
                        &mutation.key,
                        value,
                        op,
                        mutation.discard_earlier,
                        version,
                    )?;
                }
            }
            serialize_commit(&mut buffer, info.last_version);
            wal.append_batch(&buffer, self.config.sync_writes)?;

            let mut data = self.data.write();
            for (index, group) in batch.into_groups().into_iter().enumerate() {
                let version = info.group_version(index);
                for mutation in group {
                    data.entry(mutation.key).or_default().insert(VersionEntry {
                        version,
                        value: mutation.value,
                        discard_earlier: mutation.discard_earlier,
                    });
                }
            }
        }

        self.committed.store(info.last_version, Ordering::Release);
        Ok(info)
    }

    /// Rotate the WAL, dump the map and drop the segments the dump covers.
    pub(crate) fn checkpoint(&self) -> EngineResult<CheckpointInfo> {
        let _guard = self.checkpoint_lock.lock();

        let (version, snapshot, next_segment) = {
            let mut wal = self.wal.lock();
            let next_segment = wal.rotate()?;
            let version = self.committed.load(Ordering::Acquire);
            let snapshot = self.data.read().clone();
            (version, snapshot, next_segment)
        };

        let info = checkpoint::write_checkpoint(&self.checkpoint_dir(), version, &snapshot)?;
        let removed = self.wal.lock().remove_segments_before(next_segment)?;
        debug!(
            version,
            keys = info.keys,
            records = info.records,
            removed_segments = removed,
            "checkpoint written"
        );
        Ok(info)
    }
}

/// Ordered multi-version key-value engine.
///
/// All methods take `&self`; the handle can be shared behind an `Arc`.
pub struct Engine {
    inner: Arc<EngineInner>,
    gc: Mutex<Option<GcHandle>>,
}

impl Engine {
    /// Open or create an engine at `path`.
    ///
    /// Loads the newest checkpoint, replays every committed WAL batch newer
    /// than it and starts the GC thread when `gc_interval` is non-zero.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");
        let checkpoint_dir = path.join("checkpoint");
        std::fs::create_dir_all(&checkpoint_dir)
            .map_err(|e| EngineError::io(&checkpoint_dir, "create checkpoint directory", e))?;

        let (checkpoint_version, mut data) =
            checkpoint::load_latest(&checkpoint_dir)?.unwrap_or_default();

        let mut committed = checkpoint_version;
        let mut replayed = 0usize;
        for batch in WalReader::new(&wal_dir).recover_batches()? {
            if batch.last_version <= checkpoint_version {
                continue;
            }
            for entry in batch.entries {
                let value = match entry.operation {
                    Operation::Set => Some(entry.value),
                    Operation::Delete => None,
                    Operation::Commit => continue,
                };
                data.entry(entry.key).or_default().insert(VersionEntry {
                    version: entry.version,
                    value,
                    discard_earlier: entry.discard_earlier,
                });
            }
            committed = committed.max(batch.last_version);
            replayed += 1;
        }

        let wal = WalWriter::new(&wal_dir, config.wal_rotation_size_bytes)?;
        info!(
            path = %path.display(),
            keys = data.len(),
            version = committed,
            checkpoint_version,
            replayed_batches = replayed,
            "engine opened"
        );

        let gc_interval = config.gc_interval;
        let inner = Arc::new(EngineInner {
            data: RwLock::new(data),
            wal: Mutex::new(wal),
            checkpoint_lock: Mutex::new(()),
            committed: AtomicU64::new(committed),
            snapshots: SnapshotRegistry::default(),
            gc_stats: GcStats::new(),
            config,
            path,
            closed: AtomicBool::new(false),
        });

        let engine = Self { inner, gc: Mutex::new(None) };
        if !gc_interval.is_zero() {
            engine.start_gc()?;
        }
        Ok(engine)
    }

    /// Start the background GC thread if it is not already running.
    pub fn start_gc(&self) -> EngineResult<()> {
        let mut gc = self.gc.lock();
        if gc.is_none() {
            *gc = Some(gc::start_gc(Arc::clone(&self.inner), self.inner.config.gc_interval)?);
        }
        Ok(())
    }

    /// Stop the background GC thread and wait for it to exit.
    pub fn stop_gc(&self) {
        if let Some(handle) = self.gc.lock().take() {
            handle.shutdown();
        }
    }

    /// Run one GC cycle now: prune history, then checkpoint.
    pub fn run_gc(&self) -> EngineResult<GcReport> {
        if self.inner.is_closed() {
            return Err(EngineError::Closed);
        }
        gc::run_cycle(&self.inner)
    }

    /// Open a read snapshot at the last committed version.
    pub fn read_txn(&self) -> EngineResult<ReadTxn> {
        if self.inner.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(ReadTxn::new(Arc::clone(&self.inner)))
    }

    /// Run `f` against a fresh snapshot.
    pub fn view<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&ReadTxn) -> EngineResult<R>,
    {
        let txn = self.read_txn()?;
        f(&txn)
    }

    /// Build a batch with `f` and commit it if `f` succeeds.
    pub fn update<F, R>(&self, f: F) -> EngineResult<(R, CommitInfo)>
    where
        F: FnOnce(&mut WriteBatch) -> EngineResult<R>,
    {
        let mut batch = WriteBatch::new();
        let out = f(&mut batch)?;
        let info = self.commit(batch)?;
        Ok((out, info))
    }

    /// Commit `batch` atomically. Each group gets its own version.
    pub fn commit(&self, batch: WriteBatch) -> EngineResult<CommitInfo> {
        self.inner.commit(batch)
    }

    /// Write a checkpoint now.
    pub fn checkpoint(&self) -> EngineResult<CheckpointInfo> {
        self.inner.checkpoint()
    }

    /// Last committed version.
    pub fn version(&self) -> u64 {
        self.inner.committed.load(Ordering::Acquire)
    }

    /// Number of keys with at least one retained version.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots currently open.
    pub fn live_snapshots(&self) -> usize {
        self.inner.snapshots.live()
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.inner.gc_stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Stream every version newer than `since` to `writer`. Returns the
    /// snapshot version, to be passed as `since` for the next incremental
    /// backup.
    pub fn backup<W: Write>(&self, writer: W, since: u64) -> EngineResult<u64> {
        let txn = self.read_txn()?;
        let version = txn.version();
        let mut out = RecordWriter::new(writer, version)?;

        let mut resume: Option<Vec<u8>> = None;
        loop {
            let page: Vec<(Vec<u8>, Vec<VersionEntry>)> = {
                let data = self.inner.data.read();
                let range = match &resume {
                    Some(last) => data.range::<[u8], _>((
                        std::ops::Bound::Excluded(last.as_slice()),
                        std::ops::Bound::Unbounded,
                    )),
                    None => data.range::<[u8], _>(..),
                };
                range
                    .take(BACKUP_PAGE)
                    .map(|(key, chain)| {
                        let entries = chain
                            .entries()
                            .iter()
                            .filter(|e| e.version > since && e.version <= version)
                            .cloned()
                            .collect();
                        (key.clone(), entries)
                    })
                    .collect()
            };

            let Some((last_key, _)) = page.last() else { break };
            resume = Some(last_key.clone());
            for (key, entries) in &page {
                for entry in entries {
                    out.write(key, entry)?;
                }
            }
        }

        let records = out.written();
        out.finish()?;
        info!(version, since, records, "backup written");
        Ok(version)
    }

    /// Apply a stream produced by [`Engine::backup`]. Versions are kept as
    /// recorded; the committed version moves past the highest one loaded.
    /// Meant for an engine no other writer is using.
    pub fn load<R: Read>(&self, reader: R) -> EngineResult<u64> {
        if self.inner.is_closed() {
            return Err(EngineError::Closed);
        }
        let mut stream = RecordReader::new(reader)?;
        let mut total = 0u64;

        loop {
            let mut records = Vec::new();
            while records.len() < self.inner.config.max_batch_ops {
                match stream.next_record()? {
                    Some(record) => records.push(record),
                    None => break,
                }
            }
            if records.is_empty() {
                break;
            }
            total += records.len() as u64;
            self.apply_loaded(records)?;
        }

        self.inner.checkpoint()?;
        info!(records = total, snapshot_version = stream.snapshot_version(), "backup loaded");
        Ok(total)
    }

    fn apply_loaded(&self, records: Vec<(Vec<u8>, VersionEntry)>) -> EngineResult<()> {
        let inner = &self.inner;
        let mut wal = inner.wal.lock();

        let highest = records.iter().map(|(_, e)| e.version).max().unwrap_or(0);
        let marker = highest.max(inner.committed.load(Ordering::Acquire) + 1);

        let mut buffer = Vec::new();
        for (key, entry) in &records {
            let (op, value) = match &entry.value {
                Some(value) => (Operation::Set, value.as_slice()),
                None => (Operation::Delete, &[][..]),
            };
            serialize_entry(&mut buffer, key, value, op, entry.discard_earlier, entry.version)?;
        }
        serialize_commit(&mut buffer, marker);
        wal.append_batch(&buffer, inner.config.sync_writes)?;

        let mut data = inner.data.write();
        for (key, entry) in records {
            data.entry(key).or_default().insert(entry);
        }
        drop(data);

        inner.committed.store(marker, Ordering::Release);
        Ok(())
    }

    /// Stop GC, write a final checkpoint and refuse further use.
    pub fn close(&self) -> EngineResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_gc();
        let info = self.inner.checkpoint()?;
        info!(path = %self.inner.path.display(), version = info.version, "engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_gc();
        if !self.inner.is_closed() {
            if let Err(e) = self.inner.wal.lock().sync() {
                warn!(error = %e, "WAL sync on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::IterOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config() -> EngineConfig {
        EngineConfig {
            versions_to_keep: 3,
            gc_interval: Duration::ZERO,
            sync_writes: false,
            ..EngineConfig::default()
        }
    }

    fn test_engine() -> (Engine, TempDir) {
        let temp = TempDir::new().unwrap();
        let engine = Engine::open(temp.path(), test_config()).unwrap();
        (engine, temp)
    }

    fn put(engine: &Engine, key: &[u8], value: &[u8]) -> u64 {
        let mut batch = WriteBatch::new();
        batch.set(key.to_vec(), value.to_vec());
        engine.commit(batch).unwrap().last_version
    }

    fn history(engine: &Engine, key: &[u8]) -> Vec<(u64, Option<Vec<u8>>)> {
        let txn = engine.read_txn().unwrap();
        let mut iter = txn.iter(IterOptions::all_versions());
        iter.seek(key);
        let mut out = Vec::new();
        while let Some(item) = iter.item() {
            if item.key() != key {
                break;
            }
            out.push((item.version(), item.value().map(<[u8]>::to_vec)));
            iter.next();
        }
        out
    }

    #[test]
    fn test_commit_and_get() {
        let (engine, _temp) = test_engine();
        let version = put(&engine, b"k", b"v1");
        assert_eq!(version, 1);

        let txn = engine.read_txn().unwrap();
        let item = txn.get(b"k").unwrap().unwrap();
        assert_eq!(item.value(), Some(&b"v1"[..]));
        assert_eq!(item.version(), 1);
        assert!(txn.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_isolation() {
        let (engine, _temp) = test_engine();
        put(&engine, b"k", b"old");
        let before = engine.read_txn().unwrap();
        put(&engine, b"k", b"new");

        assert_eq!(before.get_value(b"k").unwrap().unwrap(), b"old");
        assert_eq!(engine.read_txn().unwrap().get_value(b"k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_view_and_update_helpers() {
        let (engine, _temp) = test_engine();
        let (count, info) = engine
            .update(|batch| {
                batch.set(b"a".to_vec(), b"1".to_vec());
                batch.set(b"b".to_vec(), b"2".to_vec());
                Ok(batch.len())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(info.last_version, 1);

        let value = engine.view(|txn| txn.get_value(b"b")).unwrap();
        assert_eq!(value.as_deref(), Some(&b"2"[..]));
        assert_eq!(engine.live_snapshots(), 0);

        let held = engine.read_txn().unwrap();
        assert_eq!(engine.live_snapshots(), 1);
        drop(held);
        assert_eq!(engine.live_snapshots(), 0);
    }

    #[test]
    fn test_update_error_commits_nothing() {
        let (engine, _temp) = test_engine();
        let result: EngineResult<((), CommitInfo)> = engine.update(|batch| {
            batch.set(b"a".to_vec(), b"1".to_vec());
            Err(EngineError::Closed)
        });
        assert!(result.is_err());
        assert_eq!(engine.version(), 0);
    }

    #[test]
    fn test_batch_is_atomic_on_validation_failure() {
        let (engine, _temp) = test_engine();
        let mut batch = WriteBatch::new();
        batch.set(b"good".to_vec(), b"v".to_vec());
        batch.set(vec![b'x'; engine.config().max_key_size + 1], b"v".to_vec());

        assert!(matches!(
            engine.commit(batch),
            Err(EngineError::OversizedEntry { component: "key", .. })
        ));
        assert!(engine.read_txn().unwrap().get(b"good").unwrap().is_none());
        assert_eq!(engine.version(), 0);
    }

    #[test]
    fn test_groups_get_distinct_versions() {
        let (engine, _temp) = test_engine();
        let mut batch = WriteBatch::new();
        batch.set(b"k".to_vec(), b"a".to_vec());
        batch.new_group().set(b"k".to_vec(), b"b".to_vec());
        batch.new_group().set(b"k".to_vec(), b"c".to_vec());
        let info = engine.commit(batch).unwrap();
        assert_eq!((info.first_version, info.last_version), (1, 3));

        let versions: Vec<u64> = history(&engine, b"k").into_iter().map(|(v, _)| v).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn test_all_versions_respects_keep_and_discard() {
        let (engine, _temp) = test_engine();
        for value in [b"1", b"2", b"3", b"4", b"5"] {
            put(&engine, b"k", value);
        }
        let values: Vec<Vec<u8>> =
            history(&engine, b"k").into_iter().filter_map(|(_, v)| v).collect();
        assert_eq!(values, vec![b"5".to_vec(), b"4".to_vec(), b"3".to_vec()]);

        let mut batch = WriteBatch::new();
        batch.set_discard(b"k".to_vec(), b"fresh".to_vec());
        engine.commit(batch).unwrap();
        assert_eq!(history(&engine, b"k").len(), 1);
    }

    #[test]
    fn test_latest_iteration_skips_tombstones() {
        let (engine, _temp) = test_engine();
        put(&engine, b"a", b"1");
        put(&engine, b"b", b"2");
        put(&engine, b"c", b"3");
        let mut batch = WriteBatch::new();
        batch.delete(b"b".to_vec());
        engine.commit(batch).unwrap();

        let txn = engine.read_txn().unwrap();
        let mut iter = txn.iter(IterOptions::default());
        iter.rewind();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.item().unwrap().key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);

        // the tombstone stays visible to history
        assert_eq!(history(&engine, b"b")[0].1, None);
    }

    #[test]
    fn test_prefix_iteration_clamps_seek() {
        let (engine, _temp) = test_engine();
        put(&engine, b"a1", b"x");
        put(&engine, b"b1", b"x");
        put(&engine, b"b2", b"x");
        put(&engine, b"c1", b"x");

        let txn = engine.read_txn().unwrap();
        let mut iter = txn.iter(IterOptions::default().with_prefix(b"b".to_vec()));
        iter.seek(b"a");
        assert_eq!(iter.item().unwrap().key(), b"b1");
        iter.next();
        assert!(iter.valid_for_prefix(b"b"));
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_reopen_replays_wal() {
        let temp = TempDir::new().unwrap();
        {
            let engine = Engine::open(temp.path(), test_config()).unwrap();
            put(&engine, b"k", b"v1");
            put(&engine, b"k", b"v2");
        }

        let engine = Engine::open(temp.path(), test_config()).unwrap();
        assert_eq!(engine.version(), 2);
        assert_eq!(history(&engine, b"k").len(), 2);
        assert_eq!(put(&engine, b"k", b"v3"), 3);
    }

    #[test]
    fn test_close_checkpoints_and_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let engine = Engine::open(temp.path(), test_config()).unwrap();
            put(&engine, b"a", b"1");
            put(&engine, b"b", b"2");
            engine.close().unwrap();
            assert!(matches!(engine.read_txn(), Err(EngineError::Closed)));
        }

        let engine = Engine::open(temp.path(), test_config()).unwrap();
        assert_eq!(engine.version(), 2);
        assert_eq!(engine.read_txn().unwrap().get_value(b"b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_gc_prunes_and_drops_discarded_tombstones() {
        let (engine, _temp) = test_engine();
        for value in [b"1", b"2", b"3", b"4", b"5"] {
            put(&engine, b"k", value);
        }
        put(&engine, b"gone", b"x");
        let mut batch = WriteBatch::new();
        batch.delete_discard(b"gone".to_vec());
        engine.commit(batch).unwrap();

        let report = engine.run_gc().unwrap();
        assert_eq!(report.versions_pruned, 3);
        assert_eq!(report.keys_dropped, 1);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_gc_keeps_versions_pinned_by_snapshot() {
        let (engine, _temp) = test_engine();
        put(&engine, b"k", b"1");
        let pinned = engine.read_txn().unwrap();
        for value in [b"2", b"3", b"4", b"5"] {
            put(&engine, b"k", value);
        }

        engine.run_gc().unwrap();
        assert_eq!(pinned.get_value(b"k").unwrap().unwrap(), b"1");
        drop(pinned);

        let report = engine.run_gc().unwrap();
        assert_eq!(report.versions_pruned, 2);
    }

    #[test]
    fn test_backup_and_load() {
        let (source, _t1) = test_engine();
        put(&source, b"a", b"1");
        put(&source, b"a", b"2");
        let mut batch = WriteBatch::new();
        batch.delete(b"b".to_vec());
        source.commit(batch).unwrap();

        let mut full = Vec::new();
        let version = source.backup(&mut full, 0).unwrap();
        assert_eq!(version, 3);

        let (target, _t2) = test_engine();
        assert_eq!(target.load(&full[..]).unwrap(), 3);
        assert_eq!(target.version(), 3);
        assert_eq!(history(&target, b"a"), history(&source, b"a"));
        assert!(target.read_txn().unwrap().get(b"b").unwrap().unwrap().is_deleted());

        put(&source, b"c", b"3");
        let mut incremental = Vec::new();
        source.backup(&mut incremental, version).unwrap();
        assert_eq!(target.load(&incremental[..]).unwrap(), 1);
        assert_eq!(target.read_txn().unwrap().get_value(b"c").unwrap().unwrap(), b"3");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.max_batch_ops = 0;
        assert!(matches!(Engine::open(temp.path(), config), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_batch_limit() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.max_batch_ops = 2;
        let engine = Engine::open(temp.path(), config).unwrap();

        let mut batch = WriteBatch::new();
        for key in [b"a", b"b", b"c"] {
            batch.set(key.to_vec(), b"v".to_vec());
        }
        assert!(matches!(
            engine.commit(batch),
            Err(EngineError::BatchTooLarge { ops: 3, max_ops: 2 })
        ));
    }
}
