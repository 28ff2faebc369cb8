//! Index storage on the encrypted engine
//!
//! Implements the index's storage contract over the engine, the cipher and
//! the write coordinator:
//!
//! - readers open one engine snapshot and decrypt on the way out
//! - iterators stay inside their prefix or range whatever the caller seeks
//! - writers never touch the engine; they resolve merges against a snapshot
//!   and submit the batch as one transaction through the coordinator, so index
//!   rows and documents share one ordering authority
//!
//! Every key is stored as `index prefix ++ index key` and encrypted with that
//! full key as associated data.

mod cursor;
mod reader;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use tinyvault_core::{Cipher, Engine};
use tinyvault_index::{IndexError, IndexResult, KvStore, KvStoreOpener, MergeOperator};

use crate::coordinator::CoordinatorHandle;
use crate::error::DbError;

pub use cursor::EncryptedIter;
pub use reader::EncryptedReader;
pub use writer::EncryptedWriter;

/// Everything an index needs to live inside the database.
#[derive(Clone)]
pub struct StoreConfig {
    /// Full key prefix of the index: collection, marker, name hash
    pub prefix: Vec<u8>,
    pub cipher: Cipher,
    pub engine: Arc<Engine>,
    pub writer: CoordinatorHandle,
    pub transaction_timeout: Duration,
}

impl StoreConfig {
    pub(crate) fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("prefix", &self.prefix)
            .field("transaction_timeout", &self.transaction_timeout)
            .finish()
    }
}

impl KvStoreOpener for StoreConfig {
    type Store = EncryptedStore;

    fn open(self, merge: Arc<dyn MergeOperator>) -> IndexResult<EncryptedStore> {
        if self.engine.is_closed() || self.writer.is_closed() {
            return Err(IndexError::Closed);
        }
        Ok(EncryptedStore { config: Arc::new(self), merge })
    }
}

/// The engine seen through one index prefix.
pub struct EncryptedStore {
    config: Arc<StoreConfig>,
    merge: Arc<dyn MergeOperator>,
}

impl EncryptedStore {
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl KvStore for EncryptedStore {
    type Reader = EncryptedReader;
    type Writer = EncryptedWriter;

    fn name(&self) -> &'static str {
        "tinyvault"
    }

    fn reader(&self) -> IndexResult<EncryptedReader> {
        EncryptedReader::new(Arc::clone(&self.config))
    }

    fn writer(&self) -> IndexResult<EncryptedWriter> {
        Ok(EncryptedWriter::new(Arc::clone(&self.config), Arc::clone(&self.merge)))
    }

    fn close(&self) -> IndexResult<()> {
        Ok(())
    }
}

/// Carry a database error through the index as a store error.
pub(crate) fn store_err(err: impl Into<DbError>) -> IndexError {
    IndexError::store(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{BatchLimits, WriteCoordinator};
    use tempfile::TempDir;
    use tinyvault_core::EngineConfig;
    use tinyvault_index::{CountMergeOperator, KvIterator, KvReader, KvWriter};

    pub(super) struct Fixture {
        pub engine: Arc<Engine>,
        pub coordinator: WriteCoordinator,
        pub _dir: TempDir,
    }

    pub(super) fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(dir.path(), EngineConfig::default()).unwrap());
        let limits =
            BatchLimits { max_ops: 1000, max_bytes: 1 << 20, window: Duration::from_millis(5) };
        let cipher = Cipher::new(&[9u8; 32]);
        let coordinator = WriteCoordinator::start(Arc::clone(&engine), cipher, limits).unwrap();
        Fixture { engine, coordinator, _dir: dir }
    }

    pub(super) fn open_store(fx: &Fixture, prefix: &[u8]) -> EncryptedStore {
        StoreConfig {
            prefix: prefix.to_vec(),
            cipher: Cipher::new(&[9u8; 32]),
            engine: Arc::clone(&fx.engine),
            writer: fx.coordinator.handle(),
            transaction_timeout: Duration::from_secs(5),
        }
        .open(Arc::new(CountMergeOperator))
        .unwrap()
    }

    #[test]
    fn test_writes_land_under_prefix_encrypted() {
        let fx = fixture();
        let store = open_store(&fx, &[5, 1, 0xAB, 0xCD]);
        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        batch.set(b"term".to_vec(), b"posting".to_vec());
        writer.execute_batch(batch).unwrap();

        let full_key = [5, 1, 0xAB, 0xCD, b't', b'e', b'r', b'm'];
        let raw = fx.engine.read_txn().unwrap().get_value(&full_key).unwrap().unwrap();
        assert_ne!(raw, b"posting".to_vec());

        let reader = store.reader().unwrap();
        assert_eq!(reader.get(b"term").unwrap(), Some(b"posting".to_vec()));
        assert_eq!(reader.get(b"other").unwrap(), None);
    }

    #[test]
    fn test_two_prefixes_are_isolated() {
        let fx = fixture();
        let a = open_store(&fx, &[5, 1, 0, 1]);
        let b = open_store(&fx, &[5, 1, 0, 2]);

        let writer = a.writer().unwrap();
        let mut batch = writer.new_batch();
        batch.set(b"k".to_vec(), b"a".to_vec());
        writer.execute_batch(batch).unwrap();

        assert!(b.reader().unwrap().get(b"k").unwrap().is_none());
        let reader = b.reader().unwrap();
        let iter = reader.prefix_iterator(b"").unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_through_coordinator() {
        let fx = fixture();
        let store = open_store(&fx, &[6, 1, 0, 0]);
        let writer = store.writer().unwrap();

        for delta in [1, 1, 1, -1] {
            let mut batch = writer.new_batch();
            batch.merge(b"count".to_vec(), CountMergeOperator::encode_delta(delta));
            writer.execute_batch(batch).unwrap();
        }

        let value = store.reader().unwrap().get(b"count").unwrap().unwrap();
        assert_eq!(CountMergeOperator::decode_count(&value), Some(2));
    }

    #[test]
    fn test_index_rows_keep_no_history() {
        let fx = fixture();
        let store = open_store(&fx, &[6, 1, 0, 0]);
        let writer = store.writer().unwrap();
        for value in [b"1", b"2", b"3"] {
            let mut batch = writer.new_batch();
            batch.set(b"k".to_vec(), value.to_vec());
            writer.execute_batch(batch).unwrap();
        }

        let txn = fx.engine.read_txn().unwrap();
        let mut iter = txn.iter(tinyvault_core::IterOptions::all_versions());
        let key = [6, 1, 0, 0, b'k'];
        iter.seek(&key);
        let mut versions = 0;
        while iter.item().map_or(false, |item| item.key() == &key[..]) {
            versions += 1;
            iter.next();
        }
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_closed_writer_surfaces_as_db_closed() {
        let fx = fixture();
        let store = open_store(&fx, &[7, 1, 0, 0]);
        fx.coordinator.shutdown();

        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        batch.set(b"k".to_vec(), b"v".to_vec());
        let err = writer.execute_batch(batch).unwrap_err();
        assert!(matches!(DbError::from(err), DbError::Closed));
    }
}
