//! Deterministic node encoding.
//!
//! Layout: header byte(s), packed partial key, then for branches the 16-bit
//! little-endian child bitmap, then the value (compact-length-prefixed when
//! inline, a bare digest when hashed), then each present child in ascending
//! slot order as a compact-length-prefixed byte sequence holding either the
//! child's own encoding (when shorter than a digest) or its digest.

use bytes::Bytes;
use filament_primitives::Hash256;

use crate::error::CodecError;
use crate::layout::TrieVersion;
use crate::nibbles::nibbles_to_key;
use crate::node::header::{encode_header, NodeVariant, EMPTY_HEADER_BYTE};
use crate::node::{Node, NodeHandle, NodeValue};
use crate::scale::write_byte_slice;

/// The encoding of the empty node.
pub fn encode_empty_node() -> Vec<u8> {
    vec![EMPTY_HEADER_BYTE]
}

/// Encodes a node under the given layout version.
pub fn encode_node(node: &Node, version: TrieVersion) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let variant = select_variant(node, version);
    encode_header(variant, node.partial_key().len(), &mut out);
    out.extend_from_slice(&nibbles_to_key(node.partial_key()));

    match node {
        Node::Leaf(leaf) => {
            encode_value(&leaf.value, version, &mut out);
        }
        Node::Branch(branch) => {
            out.extend_from_slice(&branch.children_bitmap().to_le_bytes());
            if let Some(value) = &branch.value {
                encode_value(value, version, &mut out);
            }
            for child in branch.children.iter() {
                let Some(handle) = child else { continue };
                let merkle_value = child_merkle_value(handle, version)?;
                write_byte_slice(&merkle_value, &mut out);
            }
        }
    }

    Ok(out)
}

/// The child's canonical form in its parent: its encoding if shorter than a
/// digest, else its digest. Unresolved handles already are digests.
pub fn child_merkle_value(handle: &NodeHandle, version: TrieVersion) -> Result<Vec<u8>, CodecError> {
    match handle {
        NodeHandle::Hashed(hash) => Ok(hash.to_vec()),
        NodeHandle::InMemory(node) => {
            if let Some(cached) = node.cached_merkle_value() {
                return Ok(cached.to_vec());
            }
            let encoding = encode_node(node, version)?;
            if encoding.len() < Hash256::LENGTH {
                Ok(encoding)
            } else {
                Ok(version.hash(&encoding).to_vec())
            }
        }
    }
}

/// The out-of-line value this node's encoding references, if any: the digest
/// it encodes under and the preimage the store must hold.
pub fn hashed_value_preimage(node: &Node, version: TrieVersion) -> Option<(Hash256, Bytes)> {
    match node.value() {
        Some(NodeValue::Inline(bytes)) if version.should_hash_value(bytes.len()) => {
            Some((version.hash(bytes), bytes.clone()))
        }
        _ => None,
    }
}

fn select_variant(node: &Node, version: TrieVersion) -> NodeVariant {
    match node {
        Node::Leaf(leaf) => match &leaf.value {
            NodeValue::Hashed(_) => NodeVariant::LeafWithHashedValue,
            NodeValue::Inline(bytes) if version.should_hash_value(bytes.len()) => {
                NodeVariant::LeafWithHashedValue
            }
            NodeValue::Inline(_) => NodeVariant::Leaf,
        },
        Node::Branch(branch) => match &branch.value {
            None => NodeVariant::Branch,
            Some(NodeValue::Hashed(_)) => NodeVariant::BranchWithHashedValue,
            Some(NodeValue::Inline(bytes)) if version.should_hash_value(bytes.len()) => {
                NodeVariant::BranchWithHashedValue
            }
            Some(NodeValue::Inline(_)) => NodeVariant::BranchWithValue,
        },
    }
}

fn encode_value(value: &NodeValue, version: TrieVersion, out: &mut Vec<u8>) {
    match value {
        NodeValue::Inline(bytes) if version.should_hash_value(bytes.len()) => {
            out.extend_from_slice(version.hash(bytes).as_bytes());
        }
        NodeValue::Inline(bytes) => write_byte_slice(bytes, out),
        NodeValue::Hashed(hash) => out.extend_from_slice(hash.as_bytes()),
    }
}
