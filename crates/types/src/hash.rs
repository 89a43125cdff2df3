//! Content hashing for replicated values.
//!
//! The hash is a pure function of `(version, originator_id, value)` and is
//! used for delta-dump comparisons during full sync. It is always
//! recomputed locally on ingest; a hash received on the wire is never
//! trusted for merge decisions.

use sha2::{Digest, Sha256};

/// Computes the content hash of a value.
///
/// Fields are length-prefixed before hashing so that
/// `("ab", "c")` and `("a", "bc")` cannot collide. The SHA-256 digest is
/// truncated to its first eight bytes, big-endian.
pub fn value_hash(version: i64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(version.to_be_bytes());
    hasher.update((originator_id.len() as u64).to_be_bytes());
    hasher.update(originator_id.as_bytes());
    match value {
        Some(bytes) => {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        None => hasher.update(u64::MAX.to_be_bytes()),
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
