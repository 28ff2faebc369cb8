//! Database handle
//!
//! [`Db`] owns the engine, the write coordinator and the collection
//! registry. Collections, indexes and file handles share its state through
//! an `Arc`; the handles stop working once the database is closed.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tinyvault_core::{Cipher, Engine, IterOptions, ReadTxn};
use tinyvault_index::SearchIndex;
use tracing::{debug, info, warn};

use crate::adapter::{EncryptedStore, StoreConfig};
use crate::collection::Collection;
use crate::config::DbConfig;
use crate::coordinator::{BatchLimits, WriteCoordinator};
use crate::error::{DbError, DbResult};
use crate::index::{AttachedIndex, IndexDescriptor};
use crate::registry::{CollectionState, ConfigRecord, Registry};
use crate::transaction::{Operation, Transaction, WriteContext};

/// State shared by the database and every handle it gives out.
pub(crate) struct Shared {
    pub path: PathBuf,
    pub config: DbConfig,
    pub engine: Arc<Engine>,
    pub coordinator: WriteCoordinator,
    /// Internal data key
    pub cipher: Cipher,
    outer_key: [u8; 32],
    outer: Cipher,
    pub registry: RwLock<Registry>,
    /// Serializes collection creation and removal and index attach/detach
    pub attach_lock: Mutex<()>,
    /// Files with a live writer
    pub active_files: Mutex<HashSet<String>>,
    marker_seq: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    pub fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    pub fn read_txn(&self) -> DbResult<ReadTxn> {
        self.check_open()?;
        Ok(self.engine.read_txn()?)
    }

    /// Submit `operations` as one transaction under the configured timeout.
    pub fn submit(&self, operations: Vec<Operation>) -> DbResult<u64> {
        self.check_open()?;
        let context = WriteContext::with_timeout(self.config.transaction_timeout);
        self.coordinator.submit(Transaction::with_operations(context, operations))
    }

    /// Read and decrypt the newest live value of `key`.
    pub fn load(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let txn = self.read_txn()?;
        self.load_in(&txn, key)
    }

    pub fn load_in(&self, txn: &ReadTxn, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        match txn.get_value(key)? {
            Some(sealed) => Ok(Some(self.cipher.decrypt(key, &sealed)?)),
            None => Ok(None),
        }
    }

    pub fn next_marker_seq(&self) -> u64 {
        self.marker_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Directory holding an index's private files.
    pub fn index_dir(&self, prefix: &[u8]) -> PathBuf {
        let name: String = prefix.iter().map(|b| format!("{b:02x}")).collect();
        self.path.join("indexes").join(name)
    }

    pub fn store_config(&self, prefix: Vec<u8>) -> StoreConfig {
        StoreConfig {
            prefix,
            cipher: self.cipher.clone(),
            engine: Arc::clone(&self.engine),
            writer: self.coordinator.handle(),
            transaction_timeout: self.config.transaction_timeout,
        }
    }

    /// Write the registry into the config record. Callers hold `attach_lock`.
    pub fn persist(&self) -> DbResult<()> {
        let record = self.registry.read().to_record();
        record.store(&self.engine, &self.outer)?;
        Ok(())
    }

    /// Delete every key under `prefix`, history included, in batches of at
    /// most `write_batch_max_ops` keys. Repeats until a pass finds nothing.
    pub fn purge_prefix(&self, prefix: &[u8]) -> DbResult<usize> {
        let limit = self.config.write_batch_max_ops.max(1);
        let mut purged = 0usize;
        loop {
            let keys = self.keys_to_purge(prefix, limit)?;
            if keys.is_empty() {
                break;
            }
            purged += keys.len();
            let ops =
                keys.into_iter().map(|key| Operation::delete(key).with_clean_history()).collect();
            self.submit(ops)?;
        }
        debug!(prefix = ?prefix, purged, "prefix purged");
        Ok(purged)
    }

    fn keys_to_purge(&self, prefix: &[u8], limit: usize) -> DbResult<Vec<Vec<u8>>> {
        let txn = self.read_txn()?;
        let mut iter = txn.iter(IterOptions::all_versions().with_prefix(prefix.to_vec()));
        iter.rewind();

        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut last: Option<Vec<u8>> = None;
        while let Some(item) = iter.item() {
            // Newest version first: a discarded tombstone means already purged
            if last.as_deref() != Some(item.key()) {
                last = Some(item.key().to_vec());
                if !(item.is_deleted() && item.discard_earlier()) {
                    keys.push(item.key().to_vec());
                    if keys.len() == limit {
                        break;
                    }
                }
            }
            iter.next();
        }
        Ok(keys)
    }

    /// Open an index recorded in the config record, rebuilding its private
    /// files from the descriptor first.
    fn reattach(&self, state: &CollectionState, descriptor: IndexDescriptor) -> DbResult<()> {
        let dir = self.index_dir(&descriptor.prefix);
        if !descriptor.snapshot.is_empty() {
            SearchIndex::<EncryptedStore>::restore_snapshot(&dir, &descriptor.snapshot)?;
        }
        let index = SearchIndex::open(&dir, self.store_config(descriptor.prefix.clone()))?;
        debug!(collection = %state.name, index = %descriptor.name, "index reopened");
        let name = descriptor.name.clone();
        state.indexes.write().insert(name, Arc::new(AttachedIndex::new(descriptor, index)));
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let collections: Vec<Arc<CollectionState>> =
            self.registry.read().collections.values().cloned().collect();
        for state in collections {
            for attached in state.attached() {
                if let Err(e) = attached.index.close() {
                    warn!(
                        collection = %state.name,
                        index = attached.name(),
                        error = %e,
                        "index close failed"
                    );
                }
            }
        }
        self.coordinator.shutdown();
        self.engine.close()?;
        info!(path = %self.path.display(), "database closed");
        Ok(())
    }
}

/// An open database.
///
/// ```no_run
/// use tinyvault::Db;
///
/// let db = Db::open("/tmp/vault", &[7u8; 32])?;
/// let users = db.use_collection("users")?;
/// users.put("u1", &serde_json::json!({"email": "a@b.com"}))?;
/// # Ok::<(), tinyvault::DbError>(())
/// ```
pub struct Db {
    pub(crate) shared: Arc<Shared>,
}

impl Db {
    /// Open or create a database at `path` with default settings. `key`
    /// seals the config record, which holds the internal data key.
    pub fn open<P: AsRef<Path>>(path: P, key: &[u8; 32]) -> DbResult<Self> {
        Self::open_with_config(path, key, DbConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        key: &[u8; 32],
        config: DbConfig,
    ) -> DbResult<Self> {
        config.validate().map_err(DbError::InvalidConfig)?;
        let path = path.as_ref().to_path_buf();
        let engine = Arc::new(Engine::open(&path, config.engine_config())?);
        let outer = Cipher::new(key);

        let record = match ConfigRecord::load(&engine, &outer)? {
            Some(record) => record,
            None => {
                let record = ConfigRecord::fresh();
                record.store(&engine, &outer)?;
                info!(path = %path.display(), "new database initialized");
                record
            }
        };

        let cipher = Cipher::new(&record.private_key);
        let limits = BatchLimits {
            max_ops: config.write_batch_max_ops,
            max_bytes: config.write_batch_max_bytes,
            window: config.write_batch_window,
        };
        let coordinator = WriteCoordinator::start(Arc::clone(&engine), cipher.clone(), limits)?;

        let shared = Arc::new(Shared {
            path,
            marker_seq: AtomicU64::new(engine.version()),
            config,
            engine,
            coordinator,
            cipher,
            outer_key: *key,
            outer,
            registry: RwLock::new(Registry::from_record(&record)),
            attach_lock: Mutex::new(()),
            active_files: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        let db = Db { shared };

        for collection in &record.collections {
            let state = db.state(&collection.name)?;
            for descriptor in &collection.indexes {
                db.shared.reattach(&state, descriptor.clone())?;
            }
        }
        for collection in &record.collections {
            let handle = Collection::new(Arc::clone(&db.shared), db.state(&collection.name)?);
            let replayed = handle.reconcile_indexes()?;
            if replayed > 0 {
                info!(collection = %collection.name, replayed, "pending index updates replayed");
            }
        }

        info!(
            path = %db.shared.path.display(),
            collections = record.collections.len(),
            version = db.shared.engine.version(),
            "database opened"
        );
        Ok(db)
    }

    fn state(&self, name: &str) -> DbResult<Arc<CollectionState>> {
        self.shared
            .registry
            .read()
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    /// Handle on collection `name`, created on first use.
    pub fn use_collection(&self, name: &str) -> DbResult<Collection> {
        self.shared.check_open()?;
        if let Ok(state) = self.state(name) {
            return Ok(Collection::new(Arc::clone(&self.shared), state));
        }
        self.create_collection(name)
    }

    /// Create collection `name`; fails if it exists.
    pub fn create_collection(&self, name: &str) -> DbResult<Collection> {
        self.shared.check_open()?;
        if name.is_empty() {
            return Err(DbError::InvalidConfig("collection name must not be empty".to_string()));
        }
        let _attach = self.shared.attach_lock.lock();

        let state = {
            let mut registry = self.shared.registry.write();
            if registry.collections.contains_key(name) {
                return Err(DbError::CollectionExists(name.to_string()));
            }
            let prefix = registry.allocate_prefix()?;
            let state = Arc::new(CollectionState::new(name.to_string(), prefix));
            registry.collections.insert(name.to_string(), Arc::clone(&state));
            state
        };

        if let Err(e) = self.shared.persist() {
            let mut registry = self.shared.registry.write();
            registry.collections.remove(name);
            registry.release_prefix(state.prefix);
            return Err(e);
        }
        info!(collection = name, prefix = state.prefix, "collection created");
        Ok(Collection::new(Arc::clone(&self.shared), state))
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.shared.registry.read().collections.keys().cloned().collect()
    }

    /// Drop collection `name`: its indexes, documents and history. The
    /// prefix returns to the free list once every key under it is gone.
    pub fn delete_collection(&self, name: &str) -> DbResult<()> {
        self.shared.check_open()?;
        let _attach = self.shared.attach_lock.lock();

        let state = self
            .shared
            .registry
            .write()
            .collections
            .remove(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        state.mark_dropped();

        // Taking the write lock waits out writes already in flight
        let indexes = std::mem::take(&mut *state.indexes.write());
        for attached in indexes.into_values() {
            if let Err(e) = attached.index.close() {
                warn!(collection = name, index = attached.name(), error = %e, "index close failed");
            }
            remove_dir(&self.shared.index_dir(&attached.descriptor.prefix));
        }
        self.shared.persist()?;

        let purged = self.shared.purge_prefix(&crate::keys::collection_prefix(state.prefix))?;
        self.shared.registry.write().release_prefix(state.prefix);
        self.shared.persist()?;
        info!(collection = name, prefix = state.prefix, purged, "collection deleted");
        Ok(())
    }

    /// Stream every version newer than `since` to `writer`. Returns the
    /// version to pass as `since` next time.
    pub fn backup<W: Write>(&self, writer: W, since: u64) -> DbResult<u64> {
        self.shared.check_open()?;
        Ok(self.shared.engine.backup(writer, since)?)
    }

    /// Apply a backup stream, then reopen. The stream's config record must be
    /// sealed with this database's key.
    pub fn load<R: Read>(self, reader: R) -> DbResult<Db> {
        self.shared.check_open()?;
        let records = self.shared.engine.load(reader)?;
        let path = self.shared.path.clone();
        let key = self.shared.outer_key;
        let config = self.shared.config.clone();
        self.close()?;
        drop(self);
        info!(path = %path.display(), records, "backup applied, reopening");
        Db::open_with_config(path, &key, config)
    }

    /// Close indexes, stop the writer and checkpoint the engine. Idempotent.
    pub fn close(&self) -> DbResult<()> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.check_open().is_err()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &DbConfig {
        &self.shared.config
    }

    /// Engine version of the last commit.
    pub fn version(&self) -> u64 {
        self.shared.engine.version()
    }

    /// Prune history and checkpoint now instead of waiting for the GC thread.
    pub fn run_gc(&self) -> DbResult<()> {
        self.shared.check_open()?;
        let report = self.shared.engine.run_gc()?;
        debug!(?report, "gc cycle run");
        Ok(())
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.shared.path)
            .field("collections", &self.shared.registry.read().collections.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            warn!(path = %self.shared.path.display(), error = %e, "close on drop failed");
        }
    }
}

pub(crate) fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "index directory removal failed"),
    }
}
