//! Binary format of WAL entries
//!
//! Every entry is a fixed header followed by a checksummed payload:
//! `ChunkHeader(32) + key_len(u16) + value_len(u32) + op(u8) + flags(u8)`
//! `+ version(u64) + key + value`
//!
//! A commit is a run of `Set`/`Delete` entries closed by one `Commit` entry
//! whose version is the last version of the batch. Recovery only applies runs
//! that reached their `Commit`.

use std::path::PathBuf;

use crate::config::{KEY_SIZE_CEILING, VALUE_SIZE_CEILING};
use crate::error::{EngineError, EngineResult};

/// Magic bytes identifying WAL entries: "TVWL"
pub const MAGIC_ARRAY: [u8; 4] = *b"TVWL";

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Payload bytes preceding the key: key_len + value_len + op + flags + version
pub const PAYLOAD_PREFIX: usize = 2 + 4 + 1 + 1 + 8;

/// The entry discards every earlier version of its key
pub const FLAG_DISCARD_EARLIER: u8 = 0x01;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Write a value
    Set = 1,
    /// Write a tombstone
    Delete = 2,
    /// Close the current batch
    Commit = 3,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Set),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Commit),
            _ => None,
        }
    }
}

/// Fixed-size header for each WAL entry
///
/// Layout:
///   [0..4]   magic:      "TVWL"
///   [4..8]   length:     u32  - payload length in bytes
///   [8..12]  checksum:   u32  - CRC32C of payload bytes
///   [12]     entry_type: u8   - operation type
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
    pub reserved: [u8; 3],
    pub _padding: [u8; 16],
}

/// A decoded WAL entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
    pub discard_earlier: bool,
    pub version: u64,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            entry_type: entry_type as u8,
            reserved: [0; 3],
            _padding: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
            reserved: [bytes[13], bytes[14], bytes[15]],
            _padding: [0; 16],
        }
    }
}

/// Append one serialized entry to `buffer`.
///
/// Size checks against the format ceilings happen here; the configured
/// (smaller) limits are enforced by the engine before a batch is encoded.
pub fn serialize_entry(
    buffer: &mut Vec<u8>,
    key: &[u8],
    value: &[u8],
    op: Operation,
    discard_earlier: bool,
    version: u64,
) -> EngineResult<()> {
    if key.len() > KEY_SIZE_CEILING {
        return Err(EngineError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: KEY_SIZE_CEILING as u64,
            component: "key",
        });
    }
    if value.len() > VALUE_SIZE_CEILING {
        return Err(EngineError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: VALUE_SIZE_CEILING as u64,
            component: "value",
        });
    }

    let payload_size = PAYLOAD_PREFIX + key.len() + value.len();
    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.push(op as u8);
    payload.push(if discard_earlier { FLAG_DISCARD_EARLIER } else { 0 });
    payload.extend_from_slice(&version.to_le_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let header = ChunkHeader::new(payload.len() as u32, crc32c::crc32c(&payload), op);
    buffer.reserve(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(())
}

/// Append the marker that closes a batch whose last version is `version`.
pub fn serialize_commit(buffer: &mut Vec<u8>, version: u64) {
    // Empty key and value never exceed the ceilings.
    let _ = serialize_entry(buffer, &[], &[], Operation::Commit, false, version);
}

/// Deserialize one WAL entry from the start of `data`.
pub fn deserialize_entry(data: &[u8]) -> EngineResult<WalEntry> {
    let buffer_path = || PathBuf::from("<buffer>");

    if data.len() < HEADER_SIZE {
        return Err(EngineError::Corrupted {
            path: buffer_path(),
            offset: 0,
            reason: format!("entry too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(EngineError::NoMagicFound {
            path: buffer_path(),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(EngineError::TornWrite {
            path: buffer_path(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(EngineError::ChecksumMismatch {
            path: buffer_path(),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(EngineError::Corrupted {
            path: buffer_path(),
            offset: HEADER_SIZE as u64,
            reason: "payload too short for header fields".to_string(),
        });
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let operation = Operation::from_byte(payload[6]).ok_or_else(|| EngineError::Corrupted {
        path: buffer_path(),
        offset: (HEADER_SIZE + 6) as u64,
        reason: format!("invalid operation type: {}", payload[6]),
    })?;
    let flags = payload[7];
    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&payload[8..16]);
    let version = u64::from_le_bytes(version_bytes);

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if payload.len() < value_end {
        return Err(EngineError::Corrupted {
            path: buffer_path(),
            offset: HEADER_SIZE as u64,
            reason: format!(
                "payload too short: need {} bytes for key({}) + value({})",
                value_end, key_len, value_len
            ),
        });
    }

    Ok(WalEntry {
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
        operation,
        discard_earlier: flags & FLAG_DISCARD_EARLIER != 0,
        version,
    })
}
