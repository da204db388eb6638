//! Payload integrity — the digest carried in every data-bearing message.

/// Width of the payload digest on the wire.
pub const HASH_LEN: usize = 32;

/// BLAKE3 hash of a payload.
///
/// Identical input always yields the identical digest; the header fields
/// (identifier, timestamp) never take part in it.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Recompute the digest of `payload` and compare it to `expected`.
pub fn verify(payload: &[u8], expected: &[u8; HASH_LEN]) -> bool {
    hash(payload) == *expected
}
