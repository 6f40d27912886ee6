//! The hash-function contract consumed by the trie.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::Hash256;

/// A hash function producing fixed-size digests.
///
/// The trie requires nothing beyond hashing a byte string to a comparable
/// 32-byte digest; implementations must be deterministic.
pub trait Hasher {
    /// Digest length in bytes.
    const LENGTH: usize = Hash256::LENGTH;

    /// Hashes the given data.
    fn hash(data: &[u8]) -> Hash256;
}

/// Blake2b with a 256-bit output, the reference configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2b256;

impl Hasher for Blake2b256 {
    fn hash(data: &[u8]) -> Hash256 {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(data);
        Hash256::new(hasher.finalize().into())
    }
}

/// Computes the Blake2b-256 digest of the input data.
pub fn blake2b_256(data: &[u8]) -> Hash256 {
    Blake2b256::hash(data)
}
