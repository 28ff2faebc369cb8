//! Indexes attached to collections

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tinyvault_index::{IndexMapping, SearchIndex};
use tracing::trace;

use crate::adapter::EncryptedStore;
use crate::error::DbResult;

/// Persisted description of one index, kept in the config record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Full key prefix of the index rows
    pub prefix: Vec<u8>,
    pub mapping: IndexMapping,
    /// The index's private files, used to rebuild its directory on open or
    /// after a load
    #[serde(default)]
    pub snapshot: Vec<u8>,
}

/// A live index plus the lock serializing its per-document updates.
pub(crate) struct AttachedIndex {
    pub(crate) descriptor: IndexDescriptor,
    pub(crate) index: SearchIndex<EncryptedStore>,
    sync_lock: Mutex<()>,
}

impl AttachedIndex {
    pub(crate) fn new(descriptor: IndexDescriptor, index: SearchIndex<EncryptedStore>) -> Self {
        Self { descriptor, index, sync_lock: Mutex::new(()) }
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Bring the index in line with `current`, the committed document read
    /// by `load` while the lock is held. Whoever syncs last indexes the
    /// newest value, whatever order concurrent writers finish in.
    pub(crate) fn sync<F>(&self, id: &str, load: F) -> DbResult<()>
    where
        F: FnOnce() -> DbResult<Option<Vec<u8>>>,
    {
        let _guard = self.sync_lock.lock();
        let current = load()?;
        match current.as_deref().map(serde_json::from_slice::<Value>) {
            Some(Ok(doc)) => self.index.index(id, &doc)?,
            // Deleted, or raw bytes no mapping can read
            Some(Err(_)) | None => self.index.delete(id)?,
        }
        trace!(index = self.name(), id, "index synced");
        Ok(())
    }
}

impl std::fmt::Debug for AttachedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedIndex")
            .field("name", &self.descriptor.name)
            .field("prefix", &self.descriptor.prefix)
            .finish()
    }
}
