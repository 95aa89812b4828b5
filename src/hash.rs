//! The non-cryptographic hash function used to map raw keys to the 64-bit
//! values the HLL register update consumes.
//!
//! XXH3-128 is used as the 128-bit hash, keeping only the low 64 bits.

use xxhash_rust::xxh3::xxh3_128;

/// Hashes a raw key and returns the low 64 bits of the 128-bit XXH3 digest.
pub fn hash64(key: &[u8]) -> u64 {
    xxh3_128(key) as u64
}
