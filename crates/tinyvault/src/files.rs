//! Chunked file storage
//!
//! A file lives under `[0x01][sha256(id)]`: chunk 0 holds its [`FileMeta`],
//! chunks `1..` its bytes, `chunk_size` each. Every chunk is written by its
//! own transaction through the coordinator and keeps no history. Offset
//! `o` lives in chunk `o / chunk_size + 1` at `o % chunk_size`.
//!
//! One writer per file at a time: [`Db::file_writer`] fails with
//! `FileInWrite` while another writer for the same id is alive.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tinyvault_core::IterOptions;
use tracing::{debug, info, warn};

use crate::db::{Db, Shared};
use crate::error::{DbError, DbResult};
use crate::keys;
use crate::transaction::Operation;

/// Metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub chunk_size: u64,
    pub last_modified: DateTime<Utc>,
    /// A writer was open when this was stored
    pub in_write: bool,
}

impl FileMeta {
    fn new(id: &str, name: &str, chunk_size: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            size: 0,
            chunk_size,
            last_modified: Utc::now(),
            in_write: false,
        }
    }

    /// Data chunks needed for `size` bytes.
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size)
    }

    /// Chunk index and offset within it for absolute `offset`.
    fn locate(&self, offset: u64) -> (u64, usize) {
        (offset / self.chunk_size + 1, (offset % self.chunk_size) as usize)
    }
}

fn read_meta(shared: &Shared, prefix: &[u8]) -> DbResult<Option<FileMeta>> {
    match shared.load(&keys::chunk_key(prefix, 0))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn stored_meta(shared: &Shared, prefix: &[u8], id: &str) -> DbResult<FileMeta> {
    read_meta(shared, prefix)?.ok_or_else(|| DbError::NotFound(id.to_string()))
}

fn write_meta(shared: &Shared, prefix: &[u8], meta: &FileMeta) -> DbResult<u64> {
    let op = Operation::put(keys::chunk_key(prefix, 0), serde_json::to_vec(meta)?)
        .with_clean_history()
        .for_chunk(0);
    shared.submit(vec![op])
}

fn read_chunk(shared: &Shared, prefix: &[u8], index: u64) -> DbResult<Option<Vec<u8>>> {
    shared.load(&keys::chunk_key(prefix, index))
}

fn write_chunk(shared: &Shared, prefix: &[u8], index: u64, bytes: Vec<u8>) -> DbResult<u64> {
    let op =
        Operation::put(keys::chunk_key(prefix, index), bytes).with_clean_history().for_chunk(index);
    shared.submit(vec![op])
}

/// Keys under `prefix` whose chunk index is at least `from`.
fn chunk_keys(shared: &Shared, prefix: &[u8], from: u64, limit: usize) -> DbResult<Vec<Vec<u8>>> {
    let txn = shared.read_txn()?;
    let mut iter = txn.iter(IterOptions::default().with_prefix(prefix.to_vec()));
    iter.seek(&keys::chunk_key(prefix, from));
    let mut found = Vec::new();
    while let Some(item) = iter.item() {
        if found.len() == limit {
            break;
        }
        found.push(item.key().to_vec());
        iter.next();
    }
    Ok(found)
}

/// Delete chunks `from..` in batches. Returns how many keys went.
fn delete_chunks(shared: &Shared, prefix: &[u8], from: u64) -> DbResult<usize> {
    let limit = shared.config.write_batch_max_ops.max(1);
    let mut deleted = 0usize;
    loop {
        let found = chunk_keys(shared, prefix, from, limit)?;
        if found.is_empty() {
            return Ok(deleted);
        }
        deleted += found.len();
        let ops = found
            .into_iter()
            .map(|key| {
                let index = keys::decode_chunk_index(&key[prefix.len()..]).unwrap_or_default();
                Operation::delete(key).with_clean_history().for_chunk(index)
            })
            .collect();
        shared.submit(ops)?;
    }
}

/// Copy the bytes of `meta`'s file in `[offset, offset + buf.len())` into
/// `buf`. Missing chunks read as zeros.
fn read_range(
    shared: &Shared,
    prefix: &[u8],
    meta: &FileMeta,
    buf: &mut [u8],
    offset: u64,
    cache: &mut Option<(u64, Vec<u8>)>,
) -> DbResult<usize> {
    if offset > meta.size {
        return Err(DbError::OffsetOutOfRange { id: meta.id.clone(), offset, size: meta.size });
    }
    let len = buf.len().min((meta.size - offset) as usize);
    let mut done = 0usize;
    while done < len {
        let (index, within) = meta.locate(offset + done as u64);
        let take = (len - done).min(meta.chunk_size as usize - within);
        if cache.as_ref().map(|(cached, _)| *cached) != Some(index) {
            let bytes = read_chunk(shared, prefix, index)?.unwrap_or_default();
            *cache = Some((index, bytes));
        }
        let chunk = cache.as_ref().map(|(_, bytes)| bytes.as_slice()).unwrap_or_default();

        let out = &mut buf[done..done + take];
        let available = chunk.len().saturating_sub(within).min(take);
        out[..available].copy_from_slice(&chunk[within..within + available]);
        out[available..].fill(0);
        done += take;
    }
    Ok(len)
}

fn seek_position(current: u64, size: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file"))
}

fn into_io(err: DbError) -> io::Error {
    match err {
        DbError::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// Fill `buf` from `reader` until full or end of stream.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Db file operations
// ---------------------------------------------------------------------------

impl Db {
    /// Store everything `reader` yields as file `id`, replacing any previous
    /// content.
    pub fn put_file<R: Read>(&self, id: &str, name: &str, mut reader: R) -> DbResult<FileMeta> {
        let mut writer = self.file_writer(id, name)?;
        writer.truncate()?;

        let chunk_size = writer.meta.chunk_size as usize;
        let mut buf = vec![0u8; chunk_size];
        let mut index = 1u64;
        loop {
            let n = fill(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            write_chunk(&self.shared, &writer.prefix, index, buf[..n].to_vec())?;
            writer.meta.size += n as u64;
            index += 1;
            if n < chunk_size {
                break;
            }
        }

        let meta = writer.close()?;
        info!(id, size = meta.size, chunks = meta.chunk_count(), "file stored");
        Ok(meta)
    }

    /// Stream file `id` into `writer`, chunks in key order. Returns the
    /// number of bytes written.
    pub fn read_file<W: Write>(&self, id: &str, mut writer: W) -> DbResult<u64> {
        let prefix = keys::file_prefix(id);
        let meta = stored_meta(&self.shared, &prefix, id)?;

        let txn = self.shared.read_txn()?;
        let mut iter = txn.iter(IterOptions::default().with_prefix(prefix.clone()));
        iter.seek(&keys::chunk_key(&prefix, 1));

        let mut written = 0u64;
        let mut next_index = 1u64;
        while written < meta.size {
            let current = match iter.item() {
                Some(item) => match keys::decode_chunk_index(&item.key()[prefix.len()..]) {
                    Some(index) if index == next_index => {
                        let sealed = item.value().unwrap_or_default();
                        Some(self.shared.cipher.decrypt(item.key(), sealed)?)
                    }
                    // A hole left by a sparse write
                    Some(index) if index > next_index => None,
                    _ => {
                        iter.next();
                        continue;
                    }
                },
                None => None,
            };
            if current.is_some() {
                iter.next();
            }

            let expected = meta.chunk_size.min(meta.size - written);
            let chunk = current.unwrap_or_default();
            let take = (chunk.len() as u64).min(expected);
            writer.write_all(&chunk[..take as usize])?;
            if take < expected {
                io::copy(&mut io::repeat(0).take(expected - take), &mut writer)?;
            }
            written += expected;
            next_index += 1;
        }
        writer.flush()?;
        debug!(id, bytes = written, "file read");
        Ok(written)
    }

    /// Remove file `id` and every chunk of it. Removing an absent file is a
    /// no-op, so a retry after a partial failure or timeout succeeds.
    pub fn delete_file(&self, id: &str) -> DbResult<()> {
        self.shared.check_open()?;
        {
            let mut active = self.shared.active_files.lock();
            if !active.insert(id.to_string()) {
                return Err(DbError::FileInWrite(id.to_string()));
            }
        }
        let prefix = keys::file_prefix(id);
        let result = delete_chunks(&self.shared, &prefix, 0);
        self.shared.active_files.lock().remove(id);

        match result? {
            0 => debug!(id, "file already absent"),
            keys => info!(id, keys, "file deleted"),
        }
        Ok(())
    }

    /// Random-access reader over file `id` as it is now.
    pub fn file_reader(&self, id: &str) -> DbResult<FileReader> {
        let prefix = keys::file_prefix(id);
        let meta = stored_meta(&self.shared, &prefix, id)?;
        Ok(FileReader { shared: Arc::clone(&self.shared), prefix, meta, position: 0, cache: None })
    }

    /// Exclusive writer over file `id`, created empty if absent. Existing
    /// content is kept and the writer starts at its end; `name` replaces the
    /// stored name.
    pub fn file_writer(&self, id: &str, name: &str) -> DbResult<FileWriter> {
        self.shared.check_open()?;
        if id.is_empty() {
            return Err(DbError::EmptyId);
        }
        {
            let mut active = self.shared.active_files.lock();
            if !active.insert(id.to_string()) {
                return Err(DbError::FileInWrite(id.to_string()));
            }
        }

        let prefix = keys::file_prefix(id);
        let acquired = read_meta(&self.shared, &prefix).and_then(|stored| {
            let mut meta = match stored {
                Some(meta) => {
                    if meta.in_write {
                        warn!(id, "file was left in write by an earlier process");
                    }
                    meta
                }
                None => FileMeta::new(id, name, self.shared.config.file_chunk_size as u64),
            };
            meta.name = name.to_string();
            meta.in_write = true;
            write_meta(&self.shared, &prefix, &meta)?;
            Ok(meta)
        });

        match acquired {
            Ok(meta) => {
                debug!(id, size = meta.size, "file writer acquired");
                let position = meta.size;
                Ok(FileWriter {
                    shared: Arc::clone(&self.shared),
                    prefix,
                    meta,
                    position,
                    released: false,
                })
            }
            Err(e) => {
                self.shared.active_files.lock().remove(id);
                Err(e)
            }
        }
    }

    pub fn file_meta(&self, id: &str) -> DbResult<FileMeta> {
        stored_meta(&self.shared, &keys::file_prefix(id), id)
    }

    /// Metadata of every stored file, ordered by id.
    pub fn list_files(&self) -> DbResult<Vec<FileMeta>> {
        let txn = self.shared.read_txn()?;
        let mut iter = txn.iter(IterOptions::default().with_prefix(keys::files_prefix()));
        iter.rewind();

        let file_prefix_len = 1 + keys::FILE_HASH_LEN;
        let mut files = Vec::new();
        while let Some(item) = iter.item() {
            let key = item.key();
            if key.len() < file_prefix_len {
                iter.next();
                continue;
            }
            let prefix = key[..file_prefix_len].to_vec();
            if key.len() == file_prefix_len + 1 && key[file_prefix_len] == 0x00 {
                if let Some(sealed) = item.value() {
                    let plain = self.shared.cipher.decrypt(key, sealed)?;
                    files.push(serde_json::from_slice::<FileMeta>(&plain)?);
                }
            }
            // Jump over the rest of this file's chunks
            match prefix_successor(&prefix) {
                Some(next) => iter.seek(&next),
                None => break,
            }
        }
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xFF {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads the latest stored chunks, bounded by the size seen when the reader
/// was opened; caches one decrypted chunk.
pub struct FileReader {
    shared: Arc<Shared>,
    prefix: Vec<u8>,
    meta: FileMeta,
    position: u64,
    cache: Option<(u64, Vec<u8>)>,
}

impl FileReader {
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Read into `buf` from `offset`. `0` at the end of the file; past it is
    /// `OffsetOutOfRange`.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> DbResult<usize> {
        read_range(&self.shared, &self.prefix, &self.meta, buf, offset, &mut self.cache)
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.meta.size {
            return Ok(0);
        }
        let n = self.read_at(buf, self.position).map_err(into_io)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_position(self.position, self.meta.size, pos)?;
        Ok(self.position)
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("id", &self.meta.id)
            .field("position", &self.position)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Exclusive writer. Only `close` stores the final size and clears
/// `in_write`; dropping without closing frees the file for another writer
/// but leaves it marked as in write.
pub struct FileWriter {
    shared: Arc<Shared>,
    prefix: Vec<u8>,
    meta: FileMeta,
    position: u64,
    released: bool,
}

impl FileWriter {
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Drop all content and restart at the configured chunk size. The
    /// stored metadata records the empty, still-in-write file first.
    fn truncate(&mut self) -> DbResult<()> {
        self.meta.size = 0;
        self.meta.chunk_size = self.shared.config.file_chunk_size as u64;
        self.meta.last_modified = Utc::now();
        self.position = 0;
        write_meta(&self.shared, &self.prefix, &self.meta)?;
        delete_chunks(&self.shared, &self.prefix, 1)?;
        Ok(())
    }

    /// Write `buf` at `offset`, which may be at most the current size.
    /// Partially covered chunks are read, patched and written back.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> DbResult<usize> {
        if offset > self.meta.size {
            return Err(DbError::OffsetOutOfRange {
                id: self.meta.id.clone(),
                offset,
                size: self.meta.size,
            });
        }
        let chunk_size = self.meta.chunk_size as usize;
        let mut done = 0usize;
        while done < buf.len() {
            let (index, within) = self.meta.locate(offset + done as u64);
            let take = (buf.len() - done).min(chunk_size - within);
            let part = &buf[done..done + take];

            let chunk = if within == 0 && take == chunk_size {
                part.to_vec()
            } else {
                let mut existing =
                    read_chunk(&self.shared, &self.prefix, index)?.unwrap_or_default();
                if existing.len() < within + take {
                    existing.resize(within + take, 0);
                }
                existing[within..within + take].copy_from_slice(part);
                existing
            };
            write_chunk(&self.shared, &self.prefix, index, chunk)?;
            done += take;
        }
        self.meta.size = self.meta.size.max(offset + buf.len() as u64);
        self.meta.last_modified = Utc::now();
        Ok(buf.len())
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> DbResult<usize> {
        read_range(&self.shared, &self.prefix, &self.meta, buf, offset, &mut None)
    }

    /// Store the final size with `in_write` cleared and release the file.
    pub fn close(mut self) -> DbResult<FileMeta> {
        self.meta.in_write = false;
        self.meta.last_modified = Utc::now();
        let stored = write_meta(&self.shared, &self.prefix, &self.meta);
        self.release();
        stored?;
        Ok(self.meta.clone())
    }

    /// Free the in-memory writer slot. The stored metadata is left as is.
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.active_files.lock().remove(&self.meta.id);
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_at(buf, self.position).map_err(into_io)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_position(self.position, self.meta.size, pos)?;
        Ok(self.position)
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if !self.released {
            debug!(id = %self.meta.id, "file writer dropped without close");
        }
        self.release();
    }
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("id", &self.meta.id)
            .field("size", &self.meta.size)
            .field("position", &self.position)
            .finish()
    }
}
