//! In-process store
//!
//! Copy-on-write `BTreeMap`: readers hold an `Arc` to the map as it was when
//! they were created, writers swap in an updated copy.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{IndexError, IndexResult};
use crate::store::{
    BatchOp, KeyBounds, KvBatch, KvIterator, KvReader, KvStore, KvStoreOpener, KvWriter,
    MergeOperator,
};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Opener for [`MemoryStore`]. Every open starts empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryOpener;

impl KvStoreOpener for MemoryOpener {
    type Store = MemoryStore;

    fn open(self, merge: Arc<dyn MergeOperator>) -> IndexResult<MemoryStore> {
        Ok(MemoryStore { map: Arc::new(RwLock::new(Arc::new(Map::new()))), merge })
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    map: Arc<RwLock<Arc<Map>>>,
    merge: Arc<dyn MergeOperator>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn reader(&self) -> IndexResult<MemoryReader> {
        Ok(MemoryReader { snapshot: Arc::clone(&self.map.read()) })
    }

    fn writer(&self) -> IndexResult<MemoryWriter> {
        Ok(MemoryWriter { store: self.clone() })
    }

    fn close(&self) -> IndexResult<()> {
        Ok(())
    }
}

pub struct MemoryReader {
    snapshot: Arc<Map>,
}

impl KvReader for MemoryReader {
    type Iter<'a> = MemoryIter<'a>;

    fn get(&self, key: &[u8]) -> IndexResult<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> IndexResult<MemoryIter<'_>> {
        Ok(MemoryIter::new(&self.snapshot, KeyBounds::prefix(prefix)))
    }

    fn range_iterator(&self, start: &[u8], end: &[u8]) -> IndexResult<MemoryIter<'_>> {
        Ok(MemoryIter::new(&self.snapshot, KeyBounds::range(start, end)))
    }

    fn close(self) -> IndexResult<()> {
        Ok(())
    }
}

pub struct MemoryIter<'a> {
    map: &'a Map,
    bounds: KeyBounds,
    current: Option<(&'a [u8], &'a [u8])>,
}

impl<'a> MemoryIter<'a> {
    fn new(map: &'a Map, bounds: KeyBounds) -> Self {
        let mut iter = Self { map, bounds, current: None };
        let start = iter.bounds.start().to_vec();
        iter.position(Bound::Included(&start));
        iter
    }

    fn position(&mut self, from: Bound<&Vec<u8>>) {
        let map = self.map;
        self.current = map
            .range::<Vec<u8>, _>((from, Bound::Unbounded))
            .next()
            .filter(|(key, _)| self.bounds.contains(key))
            .map(|(key, value)| (key.as_slice(), value.as_slice()));
    }
}

impl KvIterator for MemoryIter<'_> {
    fn seek(&mut self, key: &[u8]) {
        let target = self.bounds.clamp(key).to_vec();
        self.position(Bound::Included(&target));
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current {
            let key = key.to_vec();
            self.position(Bound::Excluded(&key));
        }
    }

    fn key(&self) -> Option<&[u8]> {
        self.current.map(|(key, _)| key)
    }

    fn value(&self) -> IndexResult<Option<Vec<u8>>> {
        Ok(self.current.map(|(_, value)| value.to_vec()))
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }
}

pub struct MemoryWriter {
    store: MemoryStore,
}

impl KvWriter for MemoryWriter {
    fn new_batch(&self) -> KvBatch {
        KvBatch::new(Arc::clone(&self.store.merge))
    }

    fn execute_batch(&self, batch: KvBatch) -> IndexResult<()> {
        let mut guard = self.store.map.write();
        let mut next = Map::clone(&guard);

        let (operator, ops, merges) = batch.into_parts();
        for (key, operands) in merges {
            let merged = operator
                .full_merge(&key, next.get(&key).map(Vec::as_slice), &operands)
                .ok_or(IndexError::MergeFailed { operator: operator.name(), key_len: key.len() })?;
            next.insert(key, merged);
        }
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    next.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    next.remove(&key);
                }
            }
        }

        *guard = Arc::new(next);
        Ok(())
    }

    fn close(self) -> IndexResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::CountMergeOperator;

    fn store() -> MemoryStore {
        MemoryOpener.open(Arc::new(CountMergeOperator)).unwrap()
    }

    fn fill(store: &MemoryStore, keys: &[&[u8]]) {
        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        for key in keys {
            batch.set(key.to_vec(), key.to_vec());
        }
        writer.execute_batch(batch).unwrap();
    }

    #[test]
    fn test_reader_is_a_snapshot() {
        let store = store();
        fill(&store, &[b"a"]);
        let reader = store.reader().unwrap();
        fill(&store, &[b"b"]);

        assert_eq!(reader.get(b"a").unwrap(), Some(b"a".to_vec()));
        assert_eq!(reader.get(b"b").unwrap(), None);
        assert!(store.reader().unwrap().get(b"b").unwrap().is_some());
    }

    #[test]
    fn test_prefix_iterator_clamps_seek() {
        let store = store();
        fill(&store, &[b"a1", b"b1", b"b2", b"c1"]);
        let reader = store.reader().unwrap();
        let mut iter = reader.prefix_iterator(b"b").unwrap();

        assert_eq!(iter.key(), Some(&b"b1"[..]));
        iter.seek(b"a");
        assert_eq!(iter.key(), Some(&b"b1"[..]));
        iter.next();
        assert_eq!(iter.key(), Some(&b"b2"[..]));
        iter.next();
        assert!(!iter.valid());

        iter.seek(b"c");
        assert!(!iter.valid());
    }

    #[test]
    fn test_range_iterator_excludes_end() {
        let store = store();
        fill(&store, &[b"a", b"b", b"c", b"d"]);
        let reader = store.reader().unwrap();
        let mut iter = reader.range_iterator(b"b", b"d").unwrap();

        let mut seen = Vec::new();
        while let Some((key, _)) = iter.current().unwrap() {
            seen.push(key);
            iter.next();
        }
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_merges_resolve_against_current_value() {
        let store = store();
        let writer = store.writer().unwrap();

        let mut batch = writer.new_batch();
        batch.merge(b"n".to_vec(), CountMergeOperator::encode_delta(1));
        batch.merge(b"n".to_vec(), CountMergeOperator::encode_delta(1));
        writer.execute_batch(batch).unwrap();

        let mut batch = writer.new_batch();
        batch.merge(b"n".to_vec(), CountMergeOperator::encode_delta(-1));
        writer.execute_batch(batch).unwrap();

        let value = store.reader().unwrap().get(b"n").unwrap().unwrap();
        assert_eq!(CountMergeOperator::decode_count(&value), Some(1));
    }

    #[test]
    fn test_failed_merge_leaves_store_untouched() {
        let store = store();
        let writer = store.writer().unwrap();
        let mut batch = writer.new_batch();
        batch.set(b"x".to_vec(), b"1".to_vec());
        batch.merge(b"n".to_vec(), vec![0xAA]);

        assert!(matches!(writer.execute_batch(batch), Err(IndexError::MergeFailed { .. })));
        assert!(store.is_empty());
    }
}
