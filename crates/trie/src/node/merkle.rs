//! Merkle values.
//!
//! A node's Merkle value is its encoding when that encoding is shorter than a
//! digest, otherwise the digest of the encoding. The root node is always
//! hashed, whatever its size. Computation is post-order and cached per node;
//! a cached value survives until the node is next marked dirty.

use std::sync::Arc;

use filament_primitives::Hash256;

use crate::error::CodecError;
use crate::layout::TrieVersion;
use crate::node::encode::encode_node;
use crate::node::{Node, NodeHandle};

/// The Merkle value of an encoding: inline when shorter than a digest.
pub fn merkle_value(version: TrieVersion, encoding: &[u8]) -> Vec<u8> {
    if encoding.len() < Hash256::LENGTH {
        encoding.to_vec()
    } else {
        version.hash(encoding).to_vec()
    }
}

/// The Merkle value of a root encoding: always the digest.
pub fn merkle_value_root(version: TrieVersion, encoding: &[u8]) -> Hash256 {
    version.hash(encoding)
}

/// Computes and caches the node's Merkle value, recursing into in-memory
/// children first so every cache along the spine is filled.
///
/// Nothing is recomputed for nodes that already have a cached value; a
/// mutation clears the cache, so a present cache is always current.
pub fn ensure_merkle_value(node: &mut Node, version: TrieVersion) -> Result<Vec<u8>, CodecError> {
    if let Some(cached) = node.cached_merkle_value() {
        return Ok(cached.to_vec());
    }

    if let Node::Branch(branch) = node {
        for child in branch.children.iter_mut() {
            if let Some(NodeHandle::InMemory(child_node)) = child {
                if child_node.cached_merkle_value().is_none() {
                    ensure_merkle_value(Arc::make_mut(child_node), version)?;
                }
            }
        }
    }

    let encoding = encode_node(node, version)?;
    let value = merkle_value(version, &encoding);
    node.set_merkle_value(value.clone());
    Ok(value)
}

/// Encodes the node with child caches filled, returning the encoding and its
/// root Merkle value (always a digest).
pub fn encode_and_hash_root(
    node: &mut Node,
    version: TrieVersion,
) -> Result<(Vec<u8>, Hash256), CodecError> {
    if let Node::Branch(branch) = node {
        for child in branch.children.iter_mut() {
            if let Some(NodeHandle::InMemory(child_node)) = child {
                if child_node.cached_merkle_value().is_none() {
                    ensure_merkle_value(Arc::make_mut(child_node), version)?;
                }
            }
        }
    }
    let encoding = encode_node(node, version)?;
    let hash = merkle_value_root(version, &encoding);
    Ok((encoding, hash))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::node::NodeValue;

    #[test]
    fn test_merkle_value_small_encoding_is_inline() {
        assert_eq!(merkle_value(TrieVersion::V0, &[1]), vec![1]);
    }

    #[test]
    fn test_merkle_value_long_encoding_is_hashed() {
        let encoding: Vec<u8> = (1..=33).collect();
        assert_eq!(
            hex::encode(merkle_value(TrieVersion::V0, &encoding)),
            "fcd2d9ace87052811d9f3427b58ff398d2e9ed83f301bc7ec1be8b593962f17d"
        );
    }

    #[test]
    fn test_merkle_value_root_always_hashes() {
        assert_eq!(
            merkle_value_root(TrieVersion::V0, &[1]).to_string(),
            "0xee155ace9c40292074cb6aff8c9ccdd273c81648ff1149ef36bcea6ebb8a3e25"
        );

        let encoding: Vec<u8> = (1..=33).collect();
        assert_eq!(
            hex::encode(merkle_value_root(TrieVersion::V0, &encoding).as_bytes()),
            "fcd2d9ace87052811d9f3427b58ff398d2e9ed83f301bc7ec1be8b593962f17d"
        );
    }

    #[test]
    fn test_ensure_merkle_value_caches() {
        let mut leaf = Node::new_leaf(vec![9], NodeValue::Inline(Bytes::from_static(&[1])), 0);
        assert!(leaf.cached_merkle_value().is_none());

        let value = ensure_merkle_value(&mut leaf, TrieVersion::V0).unwrap();
        assert_eq!(leaf.cached_merkle_value(), Some(&value[..]));

        // Small encodings stay inline.
        assert!(value.len() < Hash256::LENGTH);

        // Dirtying invalidates the cache.
        leaf.set_dirty(true);
        assert!(leaf.cached_merkle_value().is_none());
    }

    #[test]
    fn test_ensure_merkle_value_fills_child_caches() {
        let child = Node::new_leaf(vec![2], NodeValue::Inline(Bytes::from(vec![7u8; 40])), 0);
        let mut branch = Node::new_branch(vec![1], None, 0);
        branch.as_branch_mut().children[0] = Some(NodeHandle::InMemory(Arc::new(child)));

        ensure_merkle_value(&mut branch, TrieVersion::V0).unwrap();

        let cached_child = branch.as_branch().children[0]
            .as_ref()
            .and_then(NodeHandle::as_node)
            .unwrap();
        // The child's encoding exceeds a digest, so its cached Merkle value
        // is the 32-byte digest.
        assert_eq!(
            cached_child.cached_merkle_value().map(<[u8]>::len),
            Some(Hash256::LENGTH)
        );
    }
}
