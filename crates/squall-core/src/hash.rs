//! 32-bit FNV-1a hashing for partition routing and Merkle bucketing.
//!
//! The grid needs one stable string hash shared by every node: it decides
//! which of the 271 partitions a key lands in and which Merkle bucket its
//! record hashes into. FNV-1a over UTF-8 bytes is cheap, has no dependencies,
//! and its distribution over short keys is good enough for both uses.

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Hashes a string with 32-bit FNV-1a over its UTF-8 bytes.
#[must_use]
pub fn fnv1a(input: &str) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a `u32` by running its little-endian bytes through FNV-1a.
///
/// Used to decorrelate record hashes before XOR-folding them into Merkle
/// buckets, so that two different records do not cancel each other out as
/// easily as raw XOR would allow.
#[must_use]
pub fn mix(value: u32) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in value.to_le_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
