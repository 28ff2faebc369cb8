//! Checkpoint files and the version-record stream
//!
//! A checkpoint is a full dump of every version chain, written with the
//! atomic rename pattern:
//! 1. write `checkpoint-<version>.tvck.tmp`
//! 2. `durable_sync` the temp file
//! 3. rename over the final name
//! 4. sync the directory
//!
//! A crash before the rename leaves the previous checkpoint in charge; the
//! orphaned temp file is removed by the next checkpoint.
//!
//! The same record stream carries backups, so a backup can be loaded into any
//! engine. Stream layout: `header(16) + record* + end record`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::durability::{durable_sync, sync_dir};
use crate::error::{EngineError, EngineResult};
use crate::version::{VersionChain, VersionEntry};

/// Stream magic: "TVCK"
const STREAM_MAGIC: [u8; 4] = *b"TVCK";
/// Record magic: "TVRC"
const RECORD_MAGIC: [u8; 4] = *b"TVRC";
const STREAM_FORMAT: u32 = 1;
const STREAM_HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 24;

const FLAG_TOMBSTONE: u8 = 0x01;
const FLAG_DISCARD_EARLIER: u8 = 0x02;
const FLAG_END: u8 = 0x80;

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".tvck";

/// Record header.
///
/// Layout:
///   [0..4]   magic:     "TVRC"
///   [4..6]   key_len:   u16 LE
///   [6..10]  value_len: u32 LE
///   [10..14] checksum:  u32 LE - CRC32C of (version + key + value)
///   [14]     flags:     u8     - tombstone, discard-earlier, end
///   [15]     reserved
///   [16..24] version:   u64 LE (record count on the end record)
struct RecordHeader {
    key_len: u16,
    value_len: u32,
    checksum: u32,
    flags: u8,
    version: u64,
}

impl RecordHeader {
    fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&RECORD_MAGIC);
        buf[4..6].copy_from_slice(&self.key_len.to_le_bytes());
        buf[6..10].copy_from_slice(&self.value_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.checksum.to_le_bytes());
        buf[14] = self.flags;
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Option<Self> {
        if buf[0..4] != RECORD_MAGIC {
            return None;
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&buf[16..24]);
        Some(Self {
            key_len: u16::from_le_bytes([buf[4], buf[5]]),
            value_len: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            checksum: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            flags: buf[14],
            version: u64::from_le_bytes(version),
        })
    }
}

fn record_checksum(version: u64, key: &[u8], value: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&version.to_le_bytes());
    let crc = crc32c::crc32c_append(crc, key);
    crc32c::crc32c_append(crc, value)
}

/// Writes the version-record stream.
pub struct RecordWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Start a stream describing the engine as of `snapshot_version`.
    pub fn new(mut inner: W, snapshot_version: u64) -> EngineResult<Self> {
        let mut header = [0u8; STREAM_HEADER_SIZE];
        header[0..4].copy_from_slice(&STREAM_MAGIC);
        header[4..8].copy_from_slice(&STREAM_FORMAT.to_le_bytes());
        header[8..16].copy_from_slice(&snapshot_version.to_le_bytes());
        inner.write_all(&header)?;
        Ok(Self { inner, written: 0 })
    }

    pub fn write(&mut self, key: &[u8], entry: &VersionEntry) -> EngineResult<()> {
        let value = entry.value.as_deref().unwrap_or(&[]);
        let mut flags = 0;
        if entry.is_tombstone() {
            flags |= FLAG_TOMBSTONE;
        }
        if entry.discard_earlier {
            flags |= FLAG_DISCARD_EARLIER;
        }
        let header = RecordHeader {
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            checksum: record_checksum(entry.version, key, value),
            flags,
            version: entry.version,
        };
        self.inner.write_all(&header.to_bytes())?;
        self.inner.write_all(key)?;
        self.inner.write_all(value)?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write the end record and hand back the sink.
    pub fn finish(mut self) -> EngineResult<W> {
        let end = RecordHeader {
            key_len: 0,
            value_len: 0,
            checksum: record_checksum(self.written, &[], &[]),
            flags: FLAG_END,
            version: self.written,
        };
        self.inner.write_all(&end.to_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads the version-record stream.
pub struct RecordReader<R: Read> {
    inner: R,
    source: PathBuf,
    snapshot_version: u64,
    read: u64,
    offset: u64,
    finished: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> EngineResult<Self> {
        Self::with_source(inner, PathBuf::from("<stream>"))
    }

    fn with_source(mut inner: R, source: PathBuf) -> EngineResult<Self> {
        let mut header = [0u8; STREAM_HEADER_SIZE];
        inner
            .read_exact(&mut header)
            .map_err(|e| EngineError::io(&source, "read stream header", e))?;
        if header[0..4] != STREAM_MAGIC {
            return Err(EngineError::NoMagicFound {
                path: source,
                offset: 0,
                found_bytes: [header[0], header[1], header[2], header[3]],
            });
        }
        let format = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if format != STREAM_FORMAT {
            return Err(EngineError::Corrupted {
                path: source,
                offset: 4,
                reason: format!("unsupported stream format {}", format),
            });
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&header[8..16]);
        Ok(Self {
            inner,
            source,
            snapshot_version: u64::from_le_bytes(version),
            read: 0,
            offset: STREAM_HEADER_SIZE as u64,
            finished: false,
        })
    }

    /// Engine version the stream was taken at.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Next `(key, version)` record, `None` after the end record.
    pub fn next_record(&mut self) -> EngineResult<Option<(Vec<u8>, VersionEntry)>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.read_exact(&mut buf, RECORD_HEADER_SIZE as u32)?;
        let header = RecordHeader::from_bytes(&buf).ok_or_else(|| EngineError::NoMagicFound {
            path: self.source.clone(),
            offset: self.offset,
            found_bytes: [buf[0], buf[1], buf[2], buf[3]],
        })?;
        let record_offset = self.offset;
        self.offset += RECORD_HEADER_SIZE as u64;

        if header.flags & FLAG_END != 0 {
            if header.version != self.read {
                return Err(EngineError::Corrupted {
                    path: self.source.clone(),
                    offset: record_offset,
                    reason: format!(
                        "end record counts {} records, read {}",
                        header.version, self.read
                    ),
                });
            }
            self.finished = true;
            return Ok(None);
        }

        let mut key = vec![0u8; header.key_len as usize];
        self.read_exact(&mut key, header.key_len as u32)?;
        let mut value = vec![0u8; header.value_len as usize];
        self.read_exact(&mut value, header.value_len)?;
        self.offset += key.len() as u64 + value.len() as u64;

        let actual = record_checksum(header.version, &key, &value);
        if actual != header.checksum {
            return Err(EngineError::ChecksumMismatch {
                path: self.source.clone(),
                expected: header.checksum,
                actual,
                offset: record_offset,
            });
        }

        self.read += 1;
        let entry = VersionEntry {
            version: header.version,
            value: if header.flags & FLAG_TOMBSTONE != 0 { None } else { Some(value) },
            discard_earlier: header.flags & FLAG_DISCARD_EARLIER != 0,
        };
        Ok(Some((key, entry)))
    }

    fn read_exact(&mut self, buf: &mut [u8], expected: u32) -> EngineResult<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                EngineError::TornWrite {
                    path: self.source.clone(),
                    expected_size: expected,
                    available_bytes: 0,
                    offset: self.offset,
                }
            } else {
                EngineError::io(&self.source, "read record stream", e)
            }
        })
    }
}

/// Outcome of writing a checkpoint.
#[derive(Debug)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub version: u64,
    pub keys: usize,
    pub records: u64,
}

fn checkpoint_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}{:016x}{}", CHECKPOINT_PREFIX, version, CHECKPOINT_SUFFIX))
}

/// `(version, path)` of every finished checkpoint, oldest first.
fn list_checkpoints(dir: &Path) -> EngineResult<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(EngineError::io(dir, "read checkpoint directory", e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(hex) = name
            .strip_prefix(CHECKPOINT_PREFIX)
            .and_then(|rest| rest.strip_suffix(CHECKPOINT_SUFFIX))
        {
            if let Ok(version) = u64::from_str_radix(hex, 16) {
                found.push((version, entry.path()));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Write a full checkpoint of `data` as of `version` into `dir`, then remove
/// older checkpoints and leftover temp files.
pub fn write_checkpoint(
    dir: &Path,
    version: u64,
    data: &BTreeMap<Vec<u8>, VersionChain>,
) -> EngineResult<CheckpointInfo> {
    fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, "create checkpoint directory", e))?;

    let final_path = checkpoint_path(dir, version);
    let temp_path = final_path.with_extension("tvck.tmp");

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| EngineError::io(&temp_path, "create checkpoint", e))?;

    let mut writer = RecordWriter::new(BufWriter::new(file), version)?;
    for (key, chain) in data {
        for entry in chain.entries() {
            writer.write(key, entry)?;
        }
    }
    let records = writer.written();
    let file = writer
        .finish()?
        .into_inner()
        .map_err(|e| EngineError::io(&temp_path, "flush checkpoint", e.into_error()))?;
    durable_sync(&file).map_err(|e| EngineError::io(&temp_path, "sync checkpoint", e))?;
    drop(file);

    fs::rename(&temp_path, &final_path)
        .map_err(|e| EngineError::io(&final_path, "rename checkpoint", e))?;
    sync_dir(dir).map_err(|e| EngineError::io(dir, "sync checkpoint directory", e))?;

    for (old_version, path) in list_checkpoints(dir)? {
        if old_version < version {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove old checkpoint");
            }
        }
    }
    remove_temp_files(dir, &temp_path);

    Ok(CheckpointInfo { path: final_path, version, keys: data.len(), records })
}

fn remove_temp_files(dir: &Path, keep: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(CHECKPOINT_PREFIX) && n.ends_with(".tmp"))
            .unwrap_or(false);
        if is_temp && path != keep {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Read one checkpoint file into memory.
pub fn read_checkpoint(path: &Path) -> EngineResult<(u64, BTreeMap<Vec<u8>, VersionChain>)> {
    let file = File::open(path).map_err(|e| EngineError::io(path, "open checkpoint", e))?;
    let mut reader = RecordReader::with_source(BufReader::new(file), path.to_path_buf())?;

    let mut data: BTreeMap<Vec<u8>, VersionChain> = BTreeMap::new();
    while let Some((key, entry)) = reader.next_record()? {
        data.entry(key).or_default().insert(entry);
    }
    Ok((reader.snapshot_version(), data))
}

/// Load the newest readable checkpoint in `dir`.
///
/// A damaged newest checkpoint falls back to the previous one, if any is left.
pub fn load_latest(dir: &Path) -> EngineResult<Option<(u64, BTreeMap<Vec<u8>, VersionChain>)>> {
    for (_, path) in list_checkpoints(dir)?.into_iter().rev() {
        match read_checkpoint(&path) {
            Ok(loaded) => return Ok(Some(loaded)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(version: u64, value: Option<&str>, discard: bool) -> VersionEntry {
        VersionEntry {
            version,
            value: value.map(|v| v.as_bytes().to_vec()),
            discard_earlier: discard,
        }
    }

    fn sample() -> BTreeMap<Vec<u8>, VersionChain> {
        let mut data = BTreeMap::new();
        let mut a = VersionChain::new();
        a.insert(entry(1, Some("one"), false));
        a.insert(entry(4, None, false));
        let mut b = VersionChain::new();
        b.insert(entry(2, Some("two"), true));
        data.insert(b"a".to_vec(), a);
        data.insert(b"b".to_vec(), b);
        data
    }

    #[test]
    fn test_checkpoint_write_and_read() {
        let temp = TempDir::new().unwrap();
        let info = write_checkpoint(temp.path(), 4, &sample()).unwrap();
        assert_eq!(info.keys, 2);
        assert_eq!(info.records, 3);

        let (version, data) = read_checkpoint(&info.path).unwrap();
        assert_eq!(version, 4);
        assert_eq!(data[&b"a".to_vec()].entries(), sample()[&b"a".to_vec()].entries());
        assert!(data[&b"b".to_vec()].entries()[0].discard_earlier);
    }

    #[test]
    fn test_new_checkpoint_replaces_old() {
        let temp = TempDir::new().unwrap();
        write_checkpoint(temp.path(), 4, &sample()).unwrap();
        std::fs::write(temp.path().join("checkpoint-0000000000000009.tvck.tmp"), b"junk").unwrap();
        write_checkpoint(temp.path(), 10, &BTreeMap::new()).unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint-000000000000000a.tvck".to_string()]);

        let (version, data) = load_latest(temp.path()).unwrap().unwrap();
        assert_eq!(version, 10);
        assert!(data.is_empty());
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let mut writer = RecordWriter::new(Vec::new(), 3).unwrap();
        writer.write(b"k", &entry(3, Some("v"), false)).unwrap();
        let bytes = writer.finish().unwrap();

        let cut = &bytes[..bytes.len() - RECORD_HEADER_SIZE];
        let mut reader = RecordReader::new(cut).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(reader.next_record(), Err(EngineError::TornWrite { .. })));
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let mut writer = RecordWriter::new(Vec::new(), 3).unwrap();
        writer.write(b"key", &entry(3, Some("value"), false)).unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes[STREAM_HEADER_SIZE + RECORD_HEADER_SIZE + 1] ^= 0x01;

        let mut reader = RecordReader::new(&bytes[..]).unwrap();
        assert!(matches!(reader.next_record(), Err(EngineError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_empty_directory_has_no_checkpoint() {
        let temp = TempDir::new().unwrap();
        assert!(load_latest(temp.path()).unwrap().is_none());
        assert!(load_latest(&temp.path().join("missing")).unwrap().is_none());
    }
}
