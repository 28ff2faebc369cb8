//! Write-ahead log
//!
//! Write ordering for one commit:
//! 1. encode the whole batch (entries + commit marker) into one buffer
//! 2. append the buffer to the current segment
//! 3. `durable_sync()` when the engine runs with synced writes
//! 4. only then does the engine publish the batch in RAM
//!
//! Segments are named `wal-<seq>.tvlog`. A batch never spans two segments:
//! rotation happens between batches. Checkpoints rotate the log and delete
//! every segment the checkpoint covers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::durability::durable_sync;
use crate::error::{EngineError, EngineResult};
use crate::format::{deserialize_entry, Operation, WalEntry, HEADER_SIZE, MAGIC_ARRAY};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".tvlog";

fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX))
}

/// List `(sequence, path)` of every segment in `dir`, oldest first.
pub fn list_segments(dir: &Path) -> EngineResult<Vec<(u64, PathBuf)>> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| EngineError::io(dir, "read WAL directory", e))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(dir, "read directory entry", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(hex) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(seq) = u64::from_str_radix(hex, 16) {
                segments.push((seq, entry.path()));
            }
        }
    }
    segments.sort();
    Ok(segments)
}

/// Appends encoded batches to the current segment.
///
/// Not thread-safe on its own; the engine keeps it behind a mutex, which is
/// also what serializes version assignment.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
}

impl WalWriter {
    /// Open the newest segment in `wal_dir` for appending, creating the
    /// directory and a first segment if needed.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> EngineResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| EngineError::io(&wal_dir, "create WAL directory", e))?;

        let sequence = list_segments(&wal_dir)?.last().map(|(seq, _)| *seq).unwrap_or(0);
        let path = segment_path(&wal_dir, sequence);
        let file = Self::open_segment(&path)?;
        let size = file
            .metadata()
            .map_err(|e| EngineError::io(&path, "stat WAL file", e))?
            .len();

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    fn open_segment(path: &Path) -> EngineResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::io(path, "open WAL file", e))
    }

    /// Append one encoded batch.
    ///
    /// On a failed write or sync the segment is truncated back to its previous
    /// length, so a batch reported as failed is never replayed and a later
    /// batch never lands behind a half-written one.
    pub fn append_batch(&mut self, bytes: &[u8], sync: bool) -> EngineResult<()> {
        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        if let Err(e) = self.file.write_all(bytes) {
            let err = EngineError::io(&self.path, "WAL write failed", e);
            self.discard_tail();
            return Err(err);
        }

        if sync {
            if let Err(e) = durable_sync(&self.file) {
                let err = EngineError::io(&self.path, "WAL durable_sync failed", e);
                self.discard_tail();
                return Err(err);
            }
        }

        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Cut the segment back to the last acknowledged batch. When the file
    /// cannot be truncated the writer moves on to a fresh segment.
    fn discard_tail(&mut self) {
        if self.file.set_len(self.size).is_ok() {
            let _ = durable_sync(&self.file);
            return;
        }
        warn!(
            path = %self.path.display(),
            "could not truncate failed WAL batch, starting a new segment"
        );
        let next = segment_path(&self.wal_dir, self.sequence + 1);
        match Self::open_segment(&next) {
            Ok(file) => {
                self.sequence += 1;
                self.file = file;
                self.path = next;
                self.size = 0;
            }
            Err(e) => warn!(error = %e, "could not open a new WAL segment"),
        }
    }

    /// Seal the current segment and start the next one. Returns the new
    /// segment's sequence number.
    pub fn rotate(&mut self) -> EngineResult<u64> {
        durable_sync(&self.file)
            .map_err(|e| EngineError::io(&self.path, "WAL sync before rotation failed", e))?;

        self.sequence += 1;
        let new_path = segment_path(&self.wal_dir, self.sequence);
        self.file = Self::open_segment(&new_path)?;
        self.path = new_path;
        self.size = 0;
        Ok(self.sequence)
    }

    /// Delete every segment older than `sequence`. Returns how many were removed.
    pub fn remove_segments_before(&self, sequence: u64) -> EngineResult<usize> {
        let mut removed = 0;
        for (seq, path) in list_segments(&self.wal_dir)? {
            if seq >= sequence {
                break;
            }
            std::fs::remove_file(&path)
                .map_err(|e| EngineError::io(&path, "remove WAL segment", e))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Sync the current segment without appending.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file).map_err(|e| EngineError::io(&self.path, "WAL sync failed", e))
    }
}

/// A batch recovered from the log, in write order.
#[derive(Debug, Clone)]
pub struct RecoveredBatch {
    /// Version carried by the batch's commit marker
    pub last_version: u64,
    pub entries: Vec<WalEntry>,
}

/// Replays segments during open.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover every committed batch, oldest first.
    ///
    /// Per segment:
    /// 1. check magic; on mismatch resync to the next magic
    /// 2. a length running past EOF is the crash point: stop the segment
    /// 3. CRC mismatch: drop the open batch up to its commit marker and resync
    /// 4. a `Commit` entry closes the open batch and releases it
    ///
    /// Entries left open at the end of a segment never committed.
    pub fn recover_batches(&self) -> EngineResult<Vec<RecoveredBatch>> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }

        let mut batches = Vec::new();
        for (_, path) in list_segments(&self.wal_dir)? {
            batches.extend(self.recover_from_file(&path)?);
        }
        Ok(batches)
    }

    fn recover_from_file(&self, path: &Path) -> EngineResult<Vec<RecoveredBatch>> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut buffer))
            .map_err(|e| EngineError::io(path, "read WAL file for recovery", e))?;

        let mut batches = Vec::new();
        let mut open: Vec<WalEntry> = Vec::new();
        // set after corruption until the broken batch's commit marker
        let mut poisoned = false;
        let mut offset = 0;

        while offset + HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != MAGIC_ARRAY {
                warn!(path = %path.display(), offset, "bad magic in WAL, scanning for next entry");
                open.clear();
                poisoned = true;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total = HEADER_SIZE + length;

            if offset + total > buffer.len() {
                warn!(
                    path = %path.display(),
                    offset,
                    needed = total,
                    available = buffer.len() - offset,
                    "torn write at WAL tail"
                );
                break;
            }

            match deserialize_entry(&buffer[offset..offset + total]) {
                Ok(entry) if entry.operation == Operation::Commit => {
                    let entries = std::mem::take(&mut open);
                    if poisoned {
                        poisoned = false;
                    } else {
                        batches.push(RecoveredBatch { last_version: entry.version, entries });
                    }
                    offset += total;
                }
                Ok(entry) => {
                    open.push(entry);
                    offset += total;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        error = %e,
                        "corrupt WAL entry, dropping open batch"
                    );
                    open.clear();
                    poisoned = true;
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
            }
        }

        if !open.is_empty() {
            warn!(path = %path.display(), entries = open.len(), "discarding uncommitted WAL tail");
        }
        Ok(batches)
    }
}

/// Scan forward for the next entry magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}
