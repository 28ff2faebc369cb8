//! Snapshot reader for index rows.

use std::sync::Arc;

use tinyvault_core::{IterOptions, ReadTxn};
use tinyvault_index::{IndexResult, KeyBounds, KvReader};

use super::cursor::EncryptedIter;
use super::{store_err, StoreConfig};

/// One engine snapshot; readers never see each other's or later writes.
pub struct EncryptedReader {
    txn: ReadTxn,
    config: Arc<StoreConfig>,
}

impl EncryptedReader {
    pub(crate) fn new(config: Arc<StoreConfig>) -> IndexResult<Self> {
        let txn = config.engine.read_txn().map_err(store_err)?;
        Ok(Self { txn, config })
    }

    /// Engine version the snapshot reads at.
    pub fn version(&self) -> u64 {
        self.txn.version()
    }

    fn iter_with(&self, bounds: KeyBounds) -> EncryptedIter<'_> {
        let options = IterOptions::default().with_prefix(self.config.prefix.clone());
        EncryptedIter::new(self.txn.iter(options), &self.config, bounds)
    }
}

impl KvReader for EncryptedReader {
    type Iter<'a> = EncryptedIter<'a>;

    fn get(&self, key: &[u8]) -> IndexResult<Option<Vec<u8>>> {
        let full = self.config.full_key(key);
        match self.txn.get_value(&full).map_err(store_err)? {
            Some(sealed) => self.config.cipher.decrypt(&full, &sealed).map(Some).map_err(store_err),
            None => Ok(None),
        }
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> IndexResult<EncryptedIter<'_>> {
        Ok(self.iter_with(KeyBounds::prefix(prefix)))
    }

    fn range_iterator(&self, start: &[u8], end: &[u8]) -> IndexResult<EncryptedIter<'_>> {
        Ok(self.iter_with(KeyBounds::range(start, end)))
    }

    fn close(self) -> IndexResult<()> {
        Ok(())
    }
}
