//! Collection registry and the config record
//!
//! The config record lives at key `[0x00]`, sealed with the caller's key. It
//! holds the internal data key, the free collection prefixes and every
//! collection with its index descriptors. It is the only record not sealed
//! with the internal key, so it is committed straight to the engine rather
//! than through the coordinator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tinyvault_core::{Cipher, Engine, WriteBatch};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::index::{AttachedIndex, IndexDescriptor};
use crate::keys;

const RECORD_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CollectionRecord {
    pub name: String,
    pub prefix: u8,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ConfigRecord {
    pub format: u32,
    pub private_key: [u8; 32],
    pub free_prefixes: Vec<u8>,
    pub collections: Vec<CollectionRecord>,
}

impl ConfigRecord {
    pub fn fresh() -> Self {
        Self {
            format: RECORD_FORMAT,
            private_key: Cipher::generate_key(),
            free_prefixes: keys::all_collection_prefixes(),
            collections: Vec::new(),
        }
    }

    /// Read and unseal the record, `None` for a brand-new database.
    pub fn load(engine: &Engine, outer: &Cipher) -> DbResult<Option<Self>> {
        let txn = engine.read_txn()?;
        let Some(sealed) = txn.get_value(keys::CONFIG_KEY)? else {
            return Ok(None);
        };
        let plain = outer.decrypt(keys::CONFIG_KEY, &sealed)?;
        let record: ConfigRecord = serde_json::from_slice(&plain)?;
        if record.format != RECORD_FORMAT {
            return Err(DbError::InvalidConfig(format!(
                "config record format {} is not supported",
                record.format
            )));
        }
        Ok(Some(record))
    }

    /// Seal and commit. Earlier versions of the record are discarded.
    pub fn store(&self, engine: &Engine, outer: &Cipher) -> DbResult<u64> {
        let plain = serde_json::to_vec(self)?;
        let sealed = outer.encrypt(keys::CONFIG_KEY, &plain)?;
        let mut batch = WriteBatch::new();
        batch.set_discard(keys::CONFIG_KEY.to_vec(), sealed);
        let info = engine.commit(batch)?;
        debug!(
            version = info.last_version,
            collections = self.collections.len(),
            "config record stored"
        );
        Ok(info.last_version)
    }
}

/// Live state of one collection.
pub(crate) struct CollectionState {
    pub name: String,
    pub prefix: u8,
    pub indexes: RwLock<BTreeMap<String, Arc<AttachedIndex>>>,
    dropped: AtomicBool,
}

impl CollectionState {
    pub fn new(name: String, prefix: u8) -> Self {
        Self {
            name,
            prefix,
            indexes: RwLock::new(BTreeMap::new()),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Current indexes, cloned out so no lock is held while they are used.
    pub fn attached(&self) -> Vec<Arc<AttachedIndex>> {
        self.indexes.read().values().cloned().collect()
    }

    fn to_record(&self) -> CollectionRecord {
        CollectionRecord {
            name: self.name.clone(),
            prefix: self.prefix,
            indexes: self.indexes.read().values().map(|index| index.descriptor.clone()).collect(),
        }
    }
}

/// In-memory registry. Mutated only under the database's attach lock.
pub(crate) struct Registry {
    pub private_key: [u8; 32],
    pub free_prefixes: Vec<u8>,
    pub collections: BTreeMap<String, Arc<CollectionState>>,
}

impl Registry {
    pub fn from_record(record: &ConfigRecord) -> Self {
        let collections = record
            .collections
            .iter()
            .map(|c| (c.name.clone(), Arc::new(CollectionState::new(c.name.clone(), c.prefix))))
            .collect();
        Self {
            private_key: record.private_key,
            free_prefixes: record.free_prefixes.clone(),
            collections,
        }
    }

    pub fn to_record(&self) -> ConfigRecord {
        ConfigRecord {
            format: RECORD_FORMAT,
            private_key: self.private_key,
            free_prefixes: self.free_prefixes.clone(),
            collections: self.collections.values().map(|c| c.to_record()).collect(),
        }
    }

    /// Lowest free prefix, checked against every collection in use.
    pub fn allocate_prefix(&mut self) -> DbResult<u8> {
        while !self.free_prefixes.is_empty() {
            let prefix = self.free_prefixes.remove(0);
            if self.collections.values().all(|c| c.prefix != prefix) {
                return Ok(prefix);
            }
        }
        Err(DbError::CollectionLimit { in_use: self.collections.len() })
    }

    pub fn release_prefix(&mut self, prefix: u8) {
        if let Err(at) = self.free_prefixes.binary_search(&prefix) {
            self.free_prefixes.insert(at, prefix);
        }
    }
}
