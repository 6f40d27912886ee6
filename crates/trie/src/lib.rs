//! An authenticated key-value store: a radix-16 Merkle-Patricia trie.
//!
//! The trie maps byte keys to byte values while committing to the whole set
//! through a single Blake2b-256 root digest. It supports copy-on-write
//! snapshots sharing nodes by generation, deletion-delta tracking for store
//! pruning, lazy materialization from a byte-keyed backing store with an
//! optional two-level cache, and compact membership/non-membership proofs.
//!
//! Keys are addressed by 4-bit nibbles with path compression; nodes encode
//! deterministically (see [`node::encode`]) and hash through the pluggable
//! digest contract in `filament-primitives`.

pub mod cache;
pub mod child;
pub mod database;
pub mod deltas;
pub mod error;
pub mod layout;
pub mod nibbles;
pub mod node;
pub mod proof;
pub mod recorder;
pub mod scale;
pub mod trie;

pub use cache::{CacheStats, TrieCache};
pub use child::CHILD_STORAGE_PREFIX;
pub use database::{
    get_from_db, Batch, Database, DatabaseError, DbGetter, DbIterator, DbPutter, MemoryDatabase,
    Table,
};
pub use deltas::Deltas;
pub use error::{CodecError, ProofError, TrieError};
pub use layout::{empty_trie_hash, TrieVersion, MAX_INLINE_VALUE_SIZE};
pub use nibbles::NibblePath;
pub use node::{Node, NodeHandle, NodeValue};
pub use proof::{generate_proof, verify_proof, ProofItem};
pub use recorder::{RecordedNode, Recorder};
pub use trie::Trie;

pub use filament_primitives::{Blake2b256, Hash256, Hasher};
