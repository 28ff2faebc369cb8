//! Per-key version chains
//!
//! Every key maps to a [`VersionChain`], oldest version first. A version is
//! either a value or a tombstone, and may carry the discard-earlier flag,
//! which hides every older version from readers and marks them for GC.

/// One committed version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: u64,
    /// `None` is a tombstone
    pub value: Option<Vec<u8>>,
    pub discard_earlier: bool,
}

impl VersionEntry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Versions of a single key, ascending by version.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<VersionEntry>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self { versions: Vec::new() }
    }

    /// Add a version. Writing a version that already exists replaces it
    /// (last write within one commit group wins); versions older than the
    /// newest are placed in order, which is what backup loading needs.
    pub fn insert(&mut self, entry: VersionEntry) {
        match self.versions.last() {
            None => self.versions.push(entry),
            Some(last) if last.version < entry.version => self.versions.push(entry),
            _ => match self.versions.binary_search_by_key(&entry.version, |v| v.version) {
                Ok(pos) => self.versions[pos] = entry,
                Err(pos) => self.versions.insert(pos, entry),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn entries(&self) -> &[VersionEntry] {
        &self.versions
    }

    /// Newest version visible to a reader at `read_version`.
    pub fn latest_at(&self, read_version: u64) -> Option<&VersionEntry> {
        let end = self.versions.partition_point(|v| v.version <= read_version);
        end.checked_sub(1).map(|i| &self.versions[i])
    }

    /// Versions visible at `read_version`, newest first: at most `keep`, and
    /// none older than the first discard-earlier version met.
    pub fn visible_at(&self, read_version: u64, keep: usize) -> Vec<&VersionEntry> {
        let end = self.versions.partition_point(|v| v.version <= read_version);
        let mut visible = Vec::with_capacity(keep.min(end));
        for entry in self.versions[..end].iter().rev() {
            if visible.len() == keep {
                break;
            }
            visible.push(entry);
            if entry.discard_earlier {
                break;
            }
        }
        visible
    }

    /// Drop versions nobody can observe any more. Returns how many were removed.
    ///
    /// A version survives if it is visible at the head (retention and discard
    /// rules), or if it is at or above the version a reader at `watermark`
    /// resolves to, since that reader still sees it.
    pub fn prune(&mut self, keep: usize, watermark: u64) -> usize {
        let Some(head) = self.versions.last().map(|v| v.version) else { return 0 };
        let oldest_visible = match self.visible_at(head, keep).last() {
            Some(entry) => entry.version,
            None => return 0,
        };
        let pinned = self.latest_at(watermark).map(|v| v.version).unwrap_or(0);
        let cutoff = oldest_visible.min(pinned.max(1));

        let before = self.versions.len();
        self.versions.retain(|v| v.version >= cutoff);
        before - self.versions.len()
    }

    /// True when the chain is a lone discard-earlier tombstone no live reader
    /// can see past: the key can be forgotten entirely.
    pub fn is_dead(&self, watermark: u64) -> bool {
        match self.versions.as_slice() {
            [only] => only.is_tombstone() && only.discard_earlier && only.version <= watermark,
            _ => false,
        }
    }
}
