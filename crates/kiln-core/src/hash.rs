//! Deterministic 64-bit hashing.
//!
//! Resource identities must be stable across processes and platforms, so
//! they use FNV-1a rather than the randomly seeded hasher behind
//! [`crate::alloc::HashMap`].

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Hash a byte slice with 64-bit FNV-1a.
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash the UTF-8 bytes of a string with 64-bit FNV-1a.
#[inline]
pub fn hash_str(s: &str) -> u64 {
    hash_bytes(s.as_bytes())
}
