//! Ordered iteration over a snapshot
//!
//! The iterator re-takes the engine's read lock on every step and resumes
//! after the last key it returned, so it never blocks writers for longer than
//! one positioning. Two modes:
//!
//! - latest (default): newest visible version per key, tombstones skipped
//! - all versions: every version history exposes, newest first per key,
//!   tombstones included

use std::collections::VecDeque;
use std::ops::Bound;

use crate::txn::{Item, ReadTxn};

/// Iterator settings.
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    /// Yield every retained version instead of only the newest live one
    pub all_versions: bool,
    /// Restrict the iterator to keys starting with this prefix
    pub prefix: Option<Vec<u8>>,
}

impl IterOptions {
    pub fn all_versions() -> Self {
        Self { all_versions: true, prefix: None }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Cursor over one [`ReadTxn`]. Starts unpositioned; call `seek` or `rewind`.
pub struct EngineIter<'t> {
    txn: &'t ReadTxn,
    options: IterOptions,
    current: Option<Item>,
    /// Older versions of the current key still to visit (all-versions mode)
    pending: VecDeque<Item>,
}

impl<'t> EngineIter<'t> {
    pub(crate) fn new(txn: &'t ReadTxn, options: IterOptions) -> Self {
        Self { txn, options, current: None, pending: VecDeque::new() }
    }

    /// Position at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        let start = match &self.options.prefix {
            Some(prefix) if key < prefix.as_slice() => prefix.clone(),
            _ => key.to_vec(),
        };
        self.load_from(Bound::Included(start));
    }

    /// Position at the first key of the iterator's range.
    pub fn rewind(&mut self) {
        let start = self.options.prefix.clone().unwrap_or_default();
        self.load_from(Bound::Included(start));
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn valid_for_prefix(&self, prefix: &[u8]) -> bool {
        self.current.as_ref().map_or(false, |item| item.key().starts_with(prefix))
    }

    pub fn item(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    pub fn next(&mut self) {
        if let Some(older) = self.pending.pop_front() {
            self.current = Some(older);
            return;
        }
        if let Some(item) = self.current.take() {
            self.load_from(Bound::Excluded(item.key().to_vec()));
        }
    }

    fn load_from(&mut self, start: Bound<Vec<u8>>) {
        self.pending.clear();
        self.current = None;

        let txn = self.txn;
        let read_version = txn.version();
        let keep = txn.inner.config.versions_to_keep;
        let data = txn.inner.data.read();

        let range = match &start {
            Bound::Included(key) => {
                data.range::<[u8], _>((Bound::Included(key.as_slice()), Bound::Unbounded))
            }
            Bound::Excluded(key) => {
                data.range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
            }
            Bound::Unbounded => data.range::<[u8], _>(..),
        };

        for (key, chain) in range {
            if let Some(prefix) = &self.options.prefix {
                if !key.starts_with(prefix) {
                    break;
                }
            }

            if self.options.all_versions {
                let mut visible = chain
                    .visible_at(read_version, keep)
                    .into_iter()
                    .map(|entry| Item::from_entry(key, entry));
                if let Some(newest) = visible.next() {
                    self.current = Some(newest);
                    self.pending.extend(visible);
                    return;
                }
            } else if let Some(entry) = chain.latest_at(read_version) {
                if !entry.is_tombstone() {
                    self.current = Some(Item::from_entry(key, entry));
                    return;
                }
            }
        }
    }
}
