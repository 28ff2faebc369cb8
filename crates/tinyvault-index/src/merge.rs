//! Counting merge operator for dictionary rows
//!
//! Stored values are `u64` little-endian counts; operands are `i64`
//! little-endian deltas. Counts never go below zero.

use crate::store::MergeOperator;

#[derive(Debug, Default, Clone, Copy)]
pub struct CountMergeOperator;

impl CountMergeOperator {
    pub fn encode_delta(delta: i64) -> Vec<u8> {
        delta.to_le_bytes().to_vec()
    }

    pub fn decode_count(bytes: &[u8]) -> Option<u64> {
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn decode_delta(bytes: &[u8]) -> Option<i64> {
        Some(i64::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl MergeOperator for CountMergeOperator {
    fn full_merge(
        &self,
        _key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut count = match existing {
            Some(bytes) => Self::decode_count(bytes)? as i128,
            None => 0,
        };
        for operand in operands {
            count += Self::decode_delta(operand)? as i128;
        }
        let clamped = count.clamp(0, u64::MAX as i128) as u64;
        Some(clamped.to_le_bytes().to_vec())
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>> {
        let sum = Self::decode_delta(left)?.saturating_add(Self::decode_delta(right)?);
        Some(Self::encode_delta(sum))
    }

    fn name(&self) -> &'static str {
        "count"
    }
}
