//! Error types for the trie engine.
//!
//! Three domains are kept apart so callers can tell them apart by type:
//! [`CodecError`] for malformed node encodings, [`TrieError`] for lookup and
//! backing-store failures, and [`ProofError`] for proof generation and
//! verification. A failed proof verification is a security signal and must
//! never be conflated with "data unavailable".

use filament_primitives::Hash256;
use thiserror::Error;

/// Errors produced while encoding or decoding trie nodes.
///
/// All decode errors are fatal to the decode call; nothing is recovered
/// locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The input ended before the current field was fully read.
    #[error("reading from input: unexpected end of data")]
    UnexpectedEof,

    /// The header byte does not match any known node variant.
    #[error("node variant is unknown: for header byte {0:#010b}")]
    UnknownVariant(u8),

    /// The partial key length field overflowed the 65535-nibble cap.
    #[error("partial key length cannot be larger than 2^16: overflowed by {0}")]
    PartialKeyTooBig(u32),

    /// A compact integer started with an unsupported prefix byte.
    #[error("unknown prefix for compact uint: {0}")]
    UnknownCompactPrefix(u8),

    /// A compact integer did not fit in 32 bits.
    #[error("compact uint overflows 32 bits")]
    CompactUintTooBig,

    /// A hashed storage value field was shorter than a digest.
    #[error("hashed storage value is too short: expected {expected} bytes, got {got}")]
    HashedValueTooShort {
        /// Required digest length.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// A child field could not be read.
    #[error("cannot decode child at index {index}: {reason}")]
    DecodeChild {
        /// Branch child slot being decoded.
        index: usize,
        /// What went wrong with the child field.
        reason: String,
    },

    /// The two-byte children bitmap could not be read.
    #[error("cannot read children bitmap: unexpected end of data")]
    ReadChildrenBitmap,
}

/// Errors produced by trie operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrieError {
    /// A node encoding was malformed.
    #[error("decoding node: {0}")]
    Codec(#[from] CodecError),

    /// A referenced digest is missing from the backing store.
    #[error("incomplete database: missing node with hash {0}")]
    IncompleteDatabase(Hash256),

    /// A digest field had the wrong length.
    #[error("invalid hash length: expected {expected} bytes, got {got}")]
    InvalidHashLength {
        /// Required digest length.
        expected: usize,
        /// Bytes actually present.
        got: usize,
    },

    /// No child trie is stored under the given key.
    #[error("child trie does not exist at key 0x{}", hex::encode(.key))]
    ChildTrieDoesNotExist {
        /// The child-identifying key (without the reserved prefix).
        key: Vec<u8>,
    },

    /// A trie operation needed the backing store but none is attached.
    #[error("trie is not backed by a database")]
    NoDatabase,

    /// The backing store failed; the message carries operation context.
    #[error("database: {0}")]
    Database(String),
}

/// Errors produced while generating or verifying proofs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    /// The proof contains no nodes.
    #[error("proof is empty")]
    EmptyProof,

    /// A node required to replay the walk is missing from the proof.
    #[error("incomplete proof")]
    IncompleteProof,

    /// The proof contains a node that the walk never needs.
    #[error("extraneous node in proof")]
    ExtraneousNode,

    /// A value the proof should have omitted is present.
    #[error("extraneous value for key 0x{}", hex::encode(.key))]
    ExtraneousValue {
        /// Key whose value was not omitted.
        key: Vec<u8>,
    },

    /// A hash reference appears where the proof must carry the node inline.
    #[error("extraneous hash reference: {0}")]
    ExtraneousHashReference(Hash256),

    /// The proof implies a different value than the caller expected.
    #[error("value mismatch for key 0x{}", hex::encode(.key))]
    ValueMismatch {
        /// Key whose claimed value disagrees with the proof.
        key: Vec<u8>,
    },

    /// The same key was supplied more than once.
    #[error("duplicate key in items: 0x{}", hex::encode(.key))]
    DuplicateKey {
        /// The duplicated key.
        key: Vec<u8>,
    },

    /// The recomputed root does not match the claimed root.
    #[error("root hash mismatch: computed {computed}, expected {expected}")]
    RootMismatch {
        /// Root recomputed from the proof nodes.
        computed: Hash256,
        /// Root the caller claimed.
        expected: Hash256,
    },

    /// An inline child reference exceeded the digest size.
    #[error("invalid child reference: {0} bytes exceeds hash length")]
    InvalidChildReference(usize),

    /// A proof node encoding was malformed.
    #[error("decoding proof node: {0}")]
    Codec(#[from] CodecError),

    /// The underlying trie walk failed while recording the proof.
    #[error(transparent)]
    Trie(#[from] TrieError),
}
