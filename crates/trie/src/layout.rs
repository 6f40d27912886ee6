//! Trie layout versions.
//!
//! A layout fixes the value-inlining policy and the hash function used for
//! Merkle values. V0 stores every value inline in its node encoding; V1
//! stores values longer than 32 bytes out of line, referenced by digest.

use std::fmt;
use std::str::FromStr;

use filament_primitives::{Blake2b256, Hash256, Hasher};

/// The node-encoding layout version of a trie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TrieVersion {
    /// All values inline, no size limit.
    #[default]
    V0,
    /// Values longer than [`MAX_INLINE_VALUE_SIZE`] are stored hashed.
    V1,
}

/// V1 threshold above which a value is stored out of line.
pub const MAX_INLINE_VALUE_SIZE: usize = 32;

impl TrieVersion {
    /// Maximum value length encoded inline, or `None` for no limit.
    pub fn max_inline_value(self) -> Option<usize> {
        match self {
            TrieVersion::V0 => None,
            TrieVersion::V1 => Some(MAX_INLINE_VALUE_SIZE),
        }
    }

    /// Whether a value of this length must be stored hashed.
    pub fn should_hash_value(self, value_len: usize) -> bool {
        match self.max_inline_value() {
            Some(max) => value_len > max,
            None => false,
        }
    }

    /// Whether a trie with no entries simply omits its root node. Both
    /// versions do; the empty trie is committed to by [`empty_trie_hash`].
    pub fn allows_empty_root(self) -> bool {
        true
    }

    /// Hashes data with the layout's hash function.
    pub fn hash(self, data: &[u8]) -> Hash256 {
        Blake2b256::hash(data)
    }
}

impl fmt::Display for TrieVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrieVersion::V0 => write!(f, "V0"),
            TrieVersion::V1 => write!(f, "V1"),
        }
    }
}

impl FromStr for TrieVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V0" | "v0" | "0" => Ok(TrieVersion::V0),
            "V1" | "v1" | "1" => Ok(TrieVersion::V1),
            other => Err(format!("unknown trie version: {other}")),
        }
    }
}

/// The root digest of an empty trie: the hash of the empty-node encoding.
pub fn empty_trie_hash() -> Hash256 {
    Blake2b256::hash(&[crate::node::header::EMPTY_HEADER_BYTE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_inline_value() {
        assert_eq!(TrieVersion::V0.max_inline_value(), None);
        assert_eq!(TrieVersion::V1.max_inline_value(), Some(32));
    }

    #[test]
    fn test_should_hash_value() {
        assert!(!TrieVersion::V0.should_hash_value(10_000));
        assert!(!TrieVersion::V1.should_hash_value(32));
        assert!(TrieVersion::V1.should_hash_value(33));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("V0".parse::<TrieVersion>().unwrap(), TrieVersion::V0);
        assert_eq!("v1".parse::<TrieVersion>().unwrap(), TrieVersion::V1);
        assert!("V2".parse::<TrieVersion>().is_err());
        assert_eq!(TrieVersion::V1.to_string(), "V1");
    }

    #[test]
    fn test_empty_trie_hash_vector() {
        // Blake2b-256 of the single empty-node header byte 0x00.
        assert_eq!(
            empty_trie_hash().to_string(),
            "0x03170a2e7597b7b7e3d84c05391d139a62b157e78786d8c082f29dcf4c111314"
        );
    }
}
