//! Key-space layout
//!
//! One flat ordered key space, partitioned by the leading byte:
//!
//! ```text
//! [0x00]                                   config record
//! [0x01][sha256(file id)][chunk index]     file chunks, index 0 = metadata
//! [p][0x00][id]                            document (p in 2..=255)
//! [p][0x01][h0 h1][index row key]          index rows, h = sha256(name)[..2]
//! [p][0x02][id][0xFF][seq]                pending index update marker
//! ```

use sha2::{Digest, Sha256};

pub const CONFIG_KEY: &[u8] = &[0x00];
pub const FILE_PREFIX: u8 = 0x01;

/// First and last byte handed out to collections.
pub const FIRST_COLLECTION_PREFIX: u8 = 0x02;
pub const LAST_COLLECTION_PREFIX: u8 = 0xFF;

pub const DATA_MARKER: u8 = 0x00;
pub const INDEX_MARKER: u8 = 0x01;
pub const PENDING_MARKER: u8 = 0x02;

/// Length of the file id hash in chunk keys.
pub const FILE_HASH_LEN: usize = 32;

/// Fresh free list: every collection prefix.
pub fn all_collection_prefixes() -> Vec<u8> {
    (FIRST_COLLECTION_PREFIX..=LAST_COLLECTION_PREFIX).collect()
}

pub fn collection_prefix(prefix: u8) -> Vec<u8> {
    vec![prefix]
}

pub fn document_prefix(prefix: u8) -> Vec<u8> {
    vec![prefix, DATA_MARKER]
}

pub fn document_key(prefix: u8, id: &str) -> Vec<u8> {
    marked_key(prefix, DATA_MARKER, id)
}

pub fn pending_prefix(prefix: u8) -> Vec<u8> {
    vec![prefix, PENDING_MARKER]
}

/// One marker per write: `seq` keeps concurrent writers of the same id from
/// clearing each other's markers. `0xFF` never occurs in UTF-8, so the id is
/// recoverable.
pub fn pending_key(prefix: u8, id: &str, seq: u64) -> Vec<u8> {
    let mut key = marked_key(prefix, PENDING_MARKER, id);
    key.push(0xFF);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Id a pending marker was written for.
pub fn pending_id<'k>(key: &'k [u8], prefix: u8) -> Option<&'k str> {
    let rest = key.strip_prefix(&pending_prefix(prefix)[..])?;
    let id_len = rest.len().checked_sub(9)?;
    if rest[id_len] != 0xFF {
        return None;
    }
    std::str::from_utf8(&rest[..id_len]).ok()
}

fn marked_key(prefix: u8, marker: u8, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + id.len());
    key.push(prefix);
    key.push(marker);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Two-byte hash of an index name.
pub fn index_hash(name: &str) -> [u8; 2] {
    let digest = Sha256::digest(name.as_bytes());
    [digest[0], digest[1]]
}

pub fn index_prefix(prefix: u8, hash: [u8; 2]) -> Vec<u8> {
    vec![prefix, INDEX_MARKER, hash[0], hash[1]]
}

/// Id of a document or pending key, given the prefix it was scanned under.
pub fn strip_id<'k>(key: &'k [u8], scan_prefix: &[u8]) -> Option<&'k str> {
    key.strip_prefix(scan_prefix).and_then(|id| std::str::from_utf8(id).ok())
}

/// `[0x01][sha256(id)]`: every chunk of one file lives under it.
pub fn file_prefix(id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + FILE_HASH_LEN);
    key.push(FILE_PREFIX);
    key.extend_from_slice(&Sha256::digest(id.as_bytes()));
    key
}

pub fn files_prefix() -> Vec<u8> {
    vec![FILE_PREFIX]
}

pub fn chunk_key(file_prefix: &[u8], index: u64) -> Vec<u8> {
    let mut key = file_prefix.to_vec();
    encode_chunk_index(index, &mut key);
    key
}

/// `index / 256` bytes of `0xFF`, then `index % 256`. Byte order equals
/// numeric order, so a prefix scan visits chunks in file order.
pub fn encode_chunk_index(index: u64, out: &mut Vec<u8>) {
    let runs = (index / 256) as usize;
    out.reserve(runs + 1);
    out.extend(std::iter::repeat(0xFF).take(runs));
    out.push((index % 256) as u8);
}

pub fn decode_chunk_index(bytes: &[u8]) -> Option<u64> {
    let (last, runs) = bytes.split_last()?;
    if runs.iter().any(|&b| b != 0xFF) {
        return None;
    }
    Some(runs.len() as u64 * 256 + u64::from(*last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(index: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_chunk_index(index, &mut out);
        out
    }

    #[test]
    fn test_chunk_encoding_boundaries() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(255), vec![0xFF]);
        assert_eq!(encoded(256), vec![0xFF, 0x00]);
        assert_eq!(encoded(513), vec![0xFF, 0xFF, 0x01]);
        assert_eq!(decode_chunk_index(&encoded(513)), Some(513));
        assert_eq!(decode_chunk_index(&[0x01, 0x02]), None);
        assert_eq!(decode_chunk_index(&[]), None);
    }

    #[test]
    fn test_key_kinds_never_overlap() {
        let doc = document_key(7, "a");
        let pending = pending_key(7, "a", 1);
        let index = index_prefix(7, index_hash("email"));
        assert!(!doc.starts_with(&pending_prefix(7)));
        assert!(!pending.starts_with(&document_prefix(7)));
        assert!(!index.starts_with(&document_prefix(7)));
        assert!(doc.starts_with(&collection_prefix(7)));
        assert!(!doc.starts_with(&collection_prefix(8)));
        assert!(!file_prefix("x").starts_with(CONFIG_KEY));
    }

    #[test]
    fn test_free_list_covers_collection_range() {
        let all = all_collection_prefixes();
        assert_eq!(all.len(), 254);
        assert_eq!(all.first(), Some(&0x02));
        assert_eq!(all.last(), Some(&0xFF));
    }

    #[test]
    fn test_strip_id() {
        let key = document_key(3, "user-1");
        assert_eq!(strip_id(&key, &document_prefix(3)), Some("user-1"));
        assert_eq!(strip_id(&key, &pending_prefix(3)), None);
    }

    #[test]
    fn test_pending_id_roundtrip() {
        let key = pending_key(5, "doc-9", 42);
        assert_eq!(pending_id(&key, 5), Some("doc-9"));
        assert_eq!(pending_id(&key, 6), None);
        assert_eq!(pending_id(&pending_key(5, "", 0), 5), Some(""));
        assert_ne!(pending_key(5, "a", 1), pending_key(5, "a", 2));
        assert_eq!(pending_id(&[5, PENDING_MARKER, 1], 5), None);
    }

    proptest! {
        #[test]
        fn prop_chunk_order_matches_numeric(a in 0u64..5000, b in 0u64..5000) {
            prop_assert_eq!(a.cmp(&b), encoded(a).cmp(&encoded(b)));
            prop_assert_eq!(decode_chunk_index(&encoded(a)), Some(a));
        }
    }
}
