//! Bounded cursor over index rows.
//!
//! Bounds are expressed in the index's own key space (prefix stripped). Seeks
//! below the lower bound are clamped to it; the cursor turns invalid at the
//! first key outside the bounds.

use tinyvault_core::{EngineIter, Item};
use tinyvault_index::{IndexResult, KeyBounds, KvIterator};

use super::{store_err, StoreConfig};

pub struct EncryptedIter<'a> {
    inner: EngineIter<'a>,
    config: &'a StoreConfig,
    bounds: KeyBounds,
    valid: bool,
}

impl<'a> EncryptedIter<'a> {
    pub(crate) fn new(inner: EngineIter<'a>, config: &'a StoreConfig, bounds: KeyBounds) -> Self {
        let mut iter = Self { inner, config, bounds, valid: false };
        let start = iter.bounds.start().to_vec();
        iter.seek(&start);
        iter
    }

    fn refresh(&mut self) {
        self.valid = self
            .inner
            .item()
            .and_then(|item| item.key().strip_prefix(self.config.prefix.as_slice()))
            .map_or(false, |key| self.bounds.contains(key));
    }

    fn item(&self) -> Option<&Item> {
        if self.valid {
            self.inner.item()
        } else {
            None
        }
    }
}

impl KvIterator for EncryptedIter<'_> {
    fn seek(&mut self, key: &[u8]) {
        let target = self.config.full_key(self.bounds.clamp(key));
        self.inner.seek(&target);
        self.refresh();
    }

    fn next(&mut self) {
        if self.valid {
            self.inner.next();
            self.refresh();
        }
    }

    fn key(&self) -> Option<&[u8]> {
        let prefix_len = self.config.prefix.len();
        self.item().map(|item| &item.key()[prefix_len..])
    }

    /// Decrypts on every call; callers that only walk keys pay nothing.
    fn value(&self) -> IndexResult<Option<Vec<u8>>> {
        match self.item() {
            Some(item) => match item.value() {
                Some(sealed) => {
                    self.config.cipher.decrypt(item.key(), sealed).map(Some).map_err(store_err)
                }
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::tests::{fixture, open_store};
    use tinyvault_index::{KvIterator, KvReader, KvStore, KvWriter};

    fn keys(iter: &mut impl KvIterator) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(key) = iter.key() {
            out.push(key.to_vec());
            iter.next();
        }
        out
    }

    fn fill(store: &crate::adapter::EncryptedStore, keys: &[&str]) {
        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        for key in keys {
            batch.set(key.as_bytes(), b"v".to_vec());
        }
        writer.execute_batch(batch).unwrap();
    }

    #[test]
    fn test_bounds_and_clamping() {
        let fx = fixture();
        let store = open_store(&fx, &[4, 1, 9, 9]);
        let other = open_store(&fx, &[4, 1, 9, 8]);

        fill(&store, &["a1", "b1", "b2", "c1"]);
        fill(&other, &["b0"]);

        let reader = store.reader().unwrap();

        let mut iter = reader.prefix_iterator(b"b").unwrap();
        assert_eq!(keys(&mut iter), vec![b"b1".to_vec(), b"b2".to_vec()]);

        iter.seek(b"");
        assert_eq!(iter.key(), Some(&b"b1"[..]));
        assert_eq!(iter.value().unwrap(), Some(b"v".to_vec()));
        iter.seek(b"zz");
        assert!(!iter.valid());
        assert_eq!(iter.value().unwrap(), None);

        let mut range = reader.range_iterator(b"a2", b"c1").unwrap();
        assert_eq!(keys(&mut range), vec![b"b1".to_vec(), b"b2".to_vec()]);

        let mut all = reader.prefix_iterator(b"").unwrap();
        assert_eq!(keys(&mut all).len(), 4);
    }

    #[test]
    fn test_reader_snapshot_ignores_later_writes() {
        let fx = fixture();
        let store = open_store(&fx, &[4, 1, 0, 0]);
        let reader = store.reader().unwrap();

        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        batch.set(b"late".to_vec(), b"v".to_vec());
        writer.execute_batch(batch).unwrap();

        assert!(reader.get(b"late").unwrap().is_none());
        assert!(!reader.prefix_iterator(b"").unwrap().valid());
        assert!(store.reader().unwrap().get(b"late").unwrap().is_some());
    }
}
