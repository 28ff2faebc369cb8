//! Write batches
//!
//! A [`WriteBatch`] is committed atomically. It is split into version
//! groups: every group receives its own version, so several independent
//! transactions merged into one commit stay distinguishable in history.

/// One key-level mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Vec<u8>,
    /// `None` writes a tombstone
    pub value: Option<Vec<u8>>,
    /// Hide and later discard every earlier version of the key
    pub discard_earlier: bool,
}

impl Mutation {
    /// Key plus value length, the figure batch limits are measured in.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// Versions assigned by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub first_version: u64,
    pub last_version: u64,
}

impl CommitInfo {
    /// Version given to the `index`-th group of the batch.
    pub fn group_version(&self, index: usize) -> u64 {
        self.first_version + index as u64
    }
}

/// Mutations committed together.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    groups: Vec<Vec<Mutation>>,
}

impl WriteBatch {
    /// Empty batch with one open group.
    pub fn new() -> Self {
        Self { groups: vec![Vec::new()] }
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Mutation { key: key.into(), value: Some(value.into()), discard_earlier: false })
    }

    /// Write a value and discard all earlier versions of the key.
    pub fn set_discard(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Mutation { key: key.into(), value: Some(value.into()), discard_earlier: true })
    }

    /// Tombstone the key; history stays reachable.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Mutation { key: key.into(), value: None, discard_earlier: false })
    }

    /// Tombstone the key and discard its history; GC forgets it entirely.
    pub fn delete_discard(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Mutation { key: key.into(), value: None, discard_earlier: true })
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        if let Some(group) = self.groups.last_mut() {
            group.push(mutation);
        }
        self
    }

    /// Close the current group; later mutations get the next version.
    pub fn new_group(&mut self) -> &mut Self {
        self.groups.push(Vec::new());
        self
    }

    pub fn groups(&self) -> &[Vec<Mutation>] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of mutations across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Vec::is_empty)
    }

    pub fn mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.groups.iter().flatten()
    }

    pub(crate) fn into_groups(self) -> Vec<Vec<Mutation>> {
        self.groups
    }
}

impl Default for WriteBatch {
    fn default() -> Self { Self::new() }
}
