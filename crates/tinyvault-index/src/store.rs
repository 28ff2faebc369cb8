//! Storage contract
//!
//! The index persists everything through these traits. A backend provides:
//!
//! - [`KvStoreOpener`]: typed construction, receives the index's merge operator
//! - [`KvStore`]: hands out readers and writers
//! - [`KvReader`]: a consistent snapshot with point, prefix and range reads
//! - [`KvIterator`]: an ordered cursor that never leaves its bounds
//! - [`KvWriter`]: applies [`KvBatch`]es, resolving merges with the operator
//!
//! Keys seen through the contract are the index's own keys; any namespacing
//! the backend applies is invisible here.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::IndexResult;

/// Merge operands queued per key, oldest first.
pub type Merges = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;

/// Associative combination of values stored under one key.
pub trait MergeOperator: Send + Sync {
    /// Combine the existing value (if any) with every queued operand, oldest
    /// first. `None` means the operands could not be applied.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>>;

    /// Collapse two adjacent operands into one.
    fn partial_merge(&self, key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Builds a store once the index knows its merge operator.
pub trait KvStoreOpener {
    type Store: KvStore;

    fn open(self, merge: Arc<dyn MergeOperator>) -> IndexResult<Self::Store>;
}

pub trait KvStore: Send + Sync {
    type Reader: KvReader;
    type Writer: KvWriter;

    /// Short backend name recorded in the index metadata.
    fn name(&self) -> &'static str;

    fn reader(&self) -> IndexResult<Self::Reader>;

    fn writer(&self) -> IndexResult<Self::Writer>;

    fn close(&self) -> IndexResult<()>;
}

/// A read snapshot. Readers are independent of each other.
pub trait KvReader {
    type Iter<'a>: KvIterator
    where
        Self: 'a;

    fn get(&self, key: &[u8]) -> IndexResult<Option<Vec<u8>>>;

    fn multi_get(&self, keys: &[Vec<u8>]) -> IndexResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Cursor over keys starting with `prefix`, positioned on the first one.
    fn prefix_iterator(&self, prefix: &[u8]) -> IndexResult<Self::Iter<'_>>;

    /// Cursor over `[start, end)`, positioned on the first key.
    fn range_iterator(&self, start: &[u8], end: &[u8]) -> IndexResult<Self::Iter<'_>>;

    fn close(self) -> IndexResult<()>
    where
        Self: Sized;
}

/// Ordered cursor. Seeking outside the cursor's bounds clamps to them.
pub trait KvIterator {
    fn seek(&mut self, key: &[u8]);

    fn next(&mut self);

    fn key(&self) -> Option<&[u8]>;

    /// Value at the current position, loaded on demand.
    fn value(&self) -> IndexResult<Option<Vec<u8>>>;

    fn valid(&self) -> bool;

    fn current(&self) -> IndexResult<Option<(Vec<u8>, Vec<u8>)>> {
        match self.key() {
            Some(key) => Ok(self.value()?.map(|value| (key.to_vec(), value))),
            None => Ok(None),
        }
    }
}

pub trait KvWriter {
    fn new_batch(&self) -> KvBatch;

    /// Batch plus a scratch buffer sized from `options`, for callers that
    /// build many keys at once.
    fn new_batch_ex(&self, options: BatchOptions) -> (Vec<u8>, KvBatch) {
        let mut batch = self.new_batch();
        batch.reserve(options.num_sets + options.num_deletes);
        (Vec::with_capacity(options.total_bytes), batch)
    }

    fn execute_batch(&self, batch: KvBatch) -> IndexResult<()>;

    fn close(self) -> IndexResult<()>
    where
        Self: Sized;
}

/// Capacity hints for [`KvWriter::new_batch_ex`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub total_bytes: usize,
    pub num_sets: usize,
    pub num_deletes: usize,
    pub num_merges: usize,
}

/// Bounds of an iterator: either an exact prefix or a `[start, end)` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBounds {
    Prefix(Vec<u8>),
    Range { start: Vec<u8>, end: Vec<u8> },
}

impl KeyBounds {
    pub fn prefix(prefix: &[u8]) -> Self {
        KeyBounds::Prefix(prefix.to_vec())
    }

    pub fn range(start: &[u8], end: &[u8]) -> Self {
        KeyBounds::Range { start: start.to_vec(), end: end.to_vec() }
    }

    /// Smallest key inside the bounds.
    pub fn start(&self) -> &[u8] {
        match self {
            KeyBounds::Prefix(prefix) => prefix,
            KeyBounds::Range { start, .. } => start,
        }
    }

    /// Seek target clamped into the bounds.
    pub fn clamp<'k>(&'k self, key: &'k [u8]) -> &'k [u8] {
        if key < self.start() {
            self.start()
        } else {
            key
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            KeyBounds::Prefix(prefix) => key.starts_with(prefix),
            KeyBounds::Range { start, end } => key >= start.as_slice() && key < end.as_slice(),
        }
    }
}

/// One plain batch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// In-memory batch: ordered sets/deletes plus merge operands grouped by key.
///
/// Backends without native merges resolve `merges()` against their current
/// value with [`KvBatch::merge_operator`] before writing.
#[derive(Clone)]
pub struct KvBatch {
    operator: Arc<dyn MergeOperator>,
    ops: Vec<BatchOp>,
    merges: Merges,
}

impl KvBatch {
    pub fn new(operator: Arc<dyn MergeOperator>) -> Self {
        Self { operator, ops: Vec::new(), merges: BTreeMap::new() }
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Set { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    /// Queue an operand; operands for the same key keep their order.
    pub fn merge(&mut self, key: impl Into<Vec<u8>>, operand: impl Into<Vec<u8>>) {
        self.merges.entry(key.into()).or_default().push(operand.into());
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn merges(&self) -> &Merges {
        &self.merges
    }

    pub fn merge_operator(&self) -> &Arc<dyn MergeOperator> {
        &self.operator
    }

    pub fn len(&self) -> usize {
        self.ops.len() + self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.merges.is_empty()
    }

    /// Split into its parts: `(operator, plain ops, merges)`.
    pub fn into_parts(self) -> (Arc<dyn MergeOperator>, Vec<BatchOp>, Merges) {
        (self.operator, self.ops, self.merges)
    }
}

impl std::fmt::Debug for KvBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBatch")
            .field("operator", &self.operator.name())
            .field("ops", &self.ops.len())
            .field("merges", &self.merges.len())
            .finish()
    }
}
