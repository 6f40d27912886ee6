//! Compact membership and non-membership proofs.
//!
//! A proof is an ordered list of node encodings, the root's first. Generation
//! ([`generate_proof`]) replays recorded lookups against a stack of ancestor
//! nodes, omitting values of requested keys and the encodings of descended
//! children; verification ([`verify_proof`]) replays the same walk using only
//! the supplied nodes, substitutes the claimed values back in, and recomputes
//! the root digest bottom-up.
//!
//! The proof walk needs a view of a node encoding that keeps child fields
//! exactly as on the wire — including the empty inline field that marks an
//! omitted child — so it decodes through [`EncodedProofNode`] rather than the
//! engine's own node decoder.

mod generate;
mod verify;

pub use generate::generate_proof;
pub use verify::{verify_proof, ProofItem};

use filament_primitives::Hash256;

use crate::error::CodecError;
use crate::nibbles::nibbles_to_key;
use crate::node::header::{decode_header, encode_header, NodeVariant, EMPTY_HEADER_BYTE};
use crate::node::CHILDREN_CAPACITY;
use crate::scale::{write_byte_slice, MemoryReader};

/// A node value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EncodedValue {
    /// Raw bytes embedded in the encoding.
    Inline(Vec<u8>),
    /// Digest of an out-of-line value.
    Hashed(Hash256),
}

/// A child field as it appears on the wire. An empty inline field is the
/// marker for a child omitted from a proof node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireChild {
    /// The child's own encoding, embedded (possibly empty when omitted).
    Inline(Vec<u8>),
    /// The child's digest.
    Hash(Hash256),
}

/// A child reference being rebuilt during proof encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChildReference {
    /// The child's re-encoded bytes, embedded (empty when omitted).
    Inline(Vec<u8>),
    /// The child's digest.
    Hash(Hash256),
}

/// A decoded proof node preserving wire-level child fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EncodedProofNode {
    Empty,
    Leaf {
        partial_key: Vec<u8>,
        value: EncodedValue,
    },
    Branch {
        partial_key: Vec<u8>,
        value: Option<EncodedValue>,
        children: Box<[Option<WireChild>; CHILDREN_CAPACITY]>,
    },
}

/// Decodes a proof node, keeping child fields as on the wire.
pub(crate) fn decode_proof_node(data: &[u8]) -> Result<EncodedProofNode, CodecError> {
    let mut reader = MemoryReader::new(data);
    let (variant, partial_key_len) = decode_header(&mut reader)?;
    if variant == NodeVariant::Empty {
        return Ok(EncodedProofNode::Empty);
    }

    let partial_key_len = usize::from(partial_key_len);
    let byte_len = partial_key_len / 2 + partial_key_len % 2;
    let packed = reader.read_bytes(byte_len)?;
    let mut partial_key = crate::nibbles::key_to_nibbles(packed);
    partial_key.drain(..partial_key.len() - partial_key_len);

    let read_hashed = |reader: &mut MemoryReader<'_>| -> Result<Hash256, CodecError> {
        let got = reader.remaining().min(Hash256::LENGTH);
        let bytes = reader
            .read_bytes(Hash256::LENGTH)
            .map_err(|_| CodecError::HashedValueTooShort {
                expected: Hash256::LENGTH,
                got,
            })?;
        Ok(Hash256::from_slice(bytes).expect("length checked above"))
    };

    if !variant.is_branch() {
        let value = if variant == NodeVariant::LeafWithHashedValue {
            EncodedValue::Hashed(read_hashed(&mut reader)?)
        } else {
            EncodedValue::Inline(reader.read_byte_slice()?.to_vec())
        };
        return Ok(EncodedProofNode::Leaf { partial_key, value });
    }

    let bitmap_bytes = reader
        .read_bytes(2)
        .map_err(|_| CodecError::ReadChildrenBitmap)?;
    let bitmap = u16::from_le_bytes([bitmap_bytes[0], bitmap_bytes[1]]);

    let value = match variant {
        NodeVariant::Branch => None,
        NodeVariant::BranchWithValue => {
            Some(EncodedValue::Inline(reader.read_byte_slice()?.to_vec()))
        }
        NodeVariant::BranchWithHashedValue => Some(EncodedValue::Hashed(read_hashed(&mut reader)?)),
        _ => unreachable!("variant checked as branch above"),
    };

    let mut children: [Option<WireChild>; CHILDREN_CAPACITY] = std::array::from_fn(|_| None);
    for (index, slot) in children.iter_mut().enumerate() {
        if bitmap & (1 << index) == 0 {
            continue;
        }
        let field = reader
            .read_byte_slice()
            .map_err(|err| CodecError::DecodeChild {
                index,
                reason: err.to_string(),
            })?;
        *slot = Some(if field.len() == Hash256::LENGTH {
            WireChild::Hash(Hash256::from_slice(field).expect("length checked above"))
        } else {
            WireChild::Inline(field.to_vec())
        });
    }

    Ok(EncodedProofNode::Branch {
        partial_key,
        value,
        children: Box::new(children),
    })
}

/// Encodes a leaf from its parts, mirroring the engine codec byte for byte.
pub(crate) fn encode_leaf_parts(partial_key: &[u8], value: &EncodedValue) -> Vec<u8> {
    let mut out = Vec::new();
    let variant = match value {
        EncodedValue::Inline(_) => NodeVariant::Leaf,
        EncodedValue::Hashed(_) => NodeVariant::LeafWithHashedValue,
    };
    encode_header(variant, partial_key.len(), &mut out);
    out.extend_from_slice(&nibbles_to_key(partial_key));
    match value {
        EncodedValue::Inline(bytes) => write_byte_slice(bytes, &mut out),
        EncodedValue::Hashed(hash) => out.extend_from_slice(hash.as_bytes()),
    }
    out
}

/// Encodes a branch from its parts and rebuilt child references.
pub(crate) fn encode_branch_parts(
    partial_key: &[u8],
    value: Option<&EncodedValue>,
    children: &[Option<ChildReference>; CHILDREN_CAPACITY],
) -> Vec<u8> {
    let mut out = Vec::new();
    let variant = match value {
        None => NodeVariant::Branch,
        Some(EncodedValue::Inline(_)) => NodeVariant::BranchWithValue,
        Some(EncodedValue::Hashed(_)) => NodeVariant::BranchWithHashedValue,
    };
    encode_header(variant, partial_key.len(), &mut out);
    out.extend_from_slice(&nibbles_to_key(partial_key));

    let mut bitmap = 0u16;
    for (index, child) in children.iter().enumerate() {
        if child.is_some() {
            bitmap |= 1 << index;
        }
    }
    out.extend_from_slice(&bitmap.to_le_bytes());

    match value {
        None => {}
        Some(EncodedValue::Inline(bytes)) => write_byte_slice(bytes, &mut out),
        Some(EncodedValue::Hashed(hash)) => out.extend_from_slice(hash.as_bytes()),
    }

    for child in children.iter().flatten() {
        match child {
            ChildReference::Inline(data) => write_byte_slice(data, &mut out),
            ChildReference::Hash(hash) => write_byte_slice(hash.as_bytes(), &mut out),
        }
    }
    out
}

/// The encoding of the empty node, the proof form of an empty trie.
pub(crate) fn encode_empty_proof_node() -> Vec<u8> {
    vec![EMPTY_HEADER_BYTE]
}

/// Converts a wire child field to a rebuilt reference unchanged.
pub(crate) fn wire_child_to_reference(child: &WireChild) -> ChildReference {
    match child {
        WireChild::Inline(data) => ChildReference::Inline(data.clone()),
        WireChild::Hash(hash) => ChildReference::Hash(*hash),
    }
}
