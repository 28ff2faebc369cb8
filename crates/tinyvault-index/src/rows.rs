//! Row layout of the inverted index
//!
//! ```text
//! v                               -> [format version]
//! n                               -> u64 LE document count (merge operands)
//! d <field> 0xFF <term>           -> u64 LE doc frequency (merge operands)
//! t <field> 0xFF <term> 0xFF <id> -> u32 LE term frequency
//! b <id>                          -> JSON back row
//! ```
//!
//! `0xFF` never appears in UTF-8 text, so it separates fields and terms
//! without escaping.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

pub const FORMAT_VERSION: u8 = 1;
pub const VERSION_KEY: &[u8] = b"v";
pub const DOC_COUNT_KEY: &[u8] = b"n";

const DICTIONARY: u8 = b'd';
const TERM: u8 = b't';
const BACK: u8 = b'b';
const SEP: u8 = 0xFF;

pub fn dictionary_key(field: &str, term: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + field.len() + term.len());
    key.push(DICTIONARY);
    key.extend_from_slice(field.as_bytes());
    key.push(SEP);
    key.extend_from_slice(term.as_bytes());
    key
}

/// `t <field> 0xFF <term>`, without the trailing separator.
fn term_stem(field: &str, term: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + field.len() + term.len());
    key.push(TERM);
    key.extend_from_slice(field.as_bytes());
    key.push(SEP);
    key.extend_from_slice(term.as_bytes());
    key
}

pub fn term_key(field: &str, term: &str, id: &str) -> Vec<u8> {
    let mut key = term_stem(field, term);
    key.push(SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Prefix covering every posting of exactly `term`.
pub fn term_postings_prefix(field: &str, term: &str) -> Vec<u8> {
    let mut key = term_stem(field, term);
    key.push(SEP);
    key
}

/// Prefix covering every posting of every term starting with `prefix`.
pub fn term_prefix_scan(field: &str, prefix: &str) -> Vec<u8> {
    term_stem(field, prefix)
}

/// Prefix covering all postings of `field`.
pub fn field_prefix(field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + field.len());
    key.push(TERM);
    key.extend_from_slice(field.as_bytes());
    key.push(SEP);
    key
}

pub fn back_key(id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(BACK);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn back_prefix() -> &'static [u8] {
    &[BACK]
}

/// Split a term row key into `(term, id)` given its field prefix.
pub fn parse_term_key<'k>(key: &'k [u8], field_prefix: &[u8]) -> IndexResult<(&'k str, &'k str)> {
    let rest = key.strip_prefix(field_prefix).ok_or_else(|| {
        IndexError::CorruptRow(format!("term row outside its field ({} bytes)", key.len()))
    })?;
    let split = rest
        .iter()
        .position(|&b| b == SEP)
        .ok_or_else(|| IndexError::CorruptRow("term row without document separator".into()))?;
    let corrupt = |e: std::str::Utf8Error| IndexError::CorruptRow(e.to_string());
    let term = std::str::from_utf8(&rest[..split]).map_err(corrupt)?;
    let id = std::str::from_utf8(&rest[split + 1..]).map_err(corrupt)?;
    Ok((term, id))
}

pub fn parse_back_key(key: &[u8]) -> IndexResult<&str> {
    let id = key
        .strip_prefix(back_prefix())
        .ok_or_else(|| IndexError::CorruptRow("back row without prefix".into()))?;
    std::str::from_utf8(id).map_err(|e| IndexError::CorruptRow(e.to_string()))
}

pub fn encode_frequency(freq: u32) -> Vec<u8> {
    freq.to_le_bytes().to_vec()
}

pub fn decode_frequency(bytes: &[u8]) -> IndexResult<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| IndexError::CorruptRow(format!("term frequency of {} bytes", bytes.len())))?;
    Ok(u32::from_le_bytes(raw))
}

/// One `(field, term)` pair a document contributed, with its frequency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackTerm {
    pub field: String,
    pub term: String,
    pub freq: u32,
}

/// Every term a document is indexed under; used to undo its postings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackRow {
    pub terms: Vec<BackTerm>,
}

impl BackRow {
    pub fn encode(&self) -> IndexResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> IndexResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
