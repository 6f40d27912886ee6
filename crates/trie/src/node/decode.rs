//! Node decoding.
//!
//! The exact inverse of [`encode`](super::encode): child fields of digest
//! length are kept as unresolved [`NodeHandle::Hashed`] references, shorter
//! ones are decoded in place as inline children. Decoded nodes are clean and
//! belong to generation zero; the resolver re-tags them.

use std::sync::Arc;

use bytes::Bytes;
use filament_primitives::Hash256;

use crate::error::CodecError;
use crate::nibbles::key_to_nibbles;
use crate::node::header::{decode_header, NodeVariant};
use crate::node::{BranchNode, LeafNode, Node, NodeHandle, NodeValue, CHILDREN_CAPACITY};
use crate::scale::MemoryReader;

/// Decodes one node from the reader. `None` is the empty node.
pub fn decode_node(reader: &mut MemoryReader<'_>) -> Result<Option<Node>, CodecError> {
    let (variant, partial_key_len) = decode_header(reader)?;
    if variant == NodeVariant::Empty {
        return Ok(None);
    }

    let partial_key = decode_partial_key(reader, usize::from(partial_key_len))?;

    if variant.is_branch() {
        decode_branch(reader, variant, partial_key).map(Some)
    } else {
        decode_leaf(reader, variant, partial_key).map(Some)
    }
}

/// Decodes a node from a byte slice.
pub fn decode_node_bytes(data: &[u8]) -> Result<Option<Node>, CodecError> {
    decode_node(&mut MemoryReader::new(data))
}

fn decode_partial_key(
    reader: &mut MemoryReader<'_>,
    partial_key_len: usize,
) -> Result<Vec<u8>, CodecError> {
    let byte_len = partial_key_len / 2 + partial_key_len % 2;
    let packed = reader.read_bytes(byte_len)?;
    let mut nibbles = key_to_nibbles(packed);
    // Odd lengths carry one padding nibble at the front of the first byte.
    nibbles.drain(..nibbles.len() - partial_key_len);
    Ok(nibbles)
}

fn decode_value(
    reader: &mut MemoryReader<'_>,
    hashed: bool,
) -> Result<NodeValue, CodecError> {
    if hashed {
        let got = reader.remaining().min(Hash256::LENGTH);
        let bytes = reader
            .read_bytes(Hash256::LENGTH)
            .map_err(|_| CodecError::HashedValueTooShort {
                expected: Hash256::LENGTH,
                got,
            })?;
        let hash = Hash256::from_slice(bytes).expect("length checked above");
        Ok(NodeValue::Hashed(hash))
    } else {
        let bytes = reader.read_byte_slice()?;
        Ok(NodeValue::Inline(Bytes::copy_from_slice(bytes)))
    }
}

fn decode_leaf(
    reader: &mut MemoryReader<'_>,
    variant: NodeVariant,
    partial_key: Vec<u8>,
) -> Result<Node, CodecError> {
    let value = decode_value(reader, variant == NodeVariant::LeafWithHashedValue)?;
    Ok(Node::Leaf(LeafNode {
        partial_key,
        value,
        generation: 0,
        dirty: false,
        merkle_value: None,
    }))
}

fn decode_branch(
    reader: &mut MemoryReader<'_>,
    variant: NodeVariant,
    partial_key: Vec<u8>,
) -> Result<Node, CodecError> {
    let bitmap_bytes = reader
        .read_bytes(2)
        .map_err(|_| CodecError::ReadChildrenBitmap)?;
    let bitmap = u16::from_le_bytes([bitmap_bytes[0], bitmap_bytes[1]]);

    let value = match variant {
        NodeVariant::Branch => None,
        NodeVariant::BranchWithValue => Some(decode_value(reader, false)?),
        NodeVariant::BranchWithHashedValue => Some(decode_value(reader, true)?),
        _ => unreachable!("caller checked the variant is a branch"),
    };

    let mut children: [Option<NodeHandle>; CHILDREN_CAPACITY] = std::array::from_fn(|_| None);
    let mut descendants = 0u32;
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
        if field.len() == Hash256::LENGTH {
            let hash = Hash256::from_slice(field).expect("length checked above");
            *slot = Some(NodeHandle::Hashed(hash));
            descendants += 1;
        } else {
            let child = decode_node_bytes(field)
                .map_err(|err| CodecError::DecodeChild {
                    index,
                    reason: err.to_string(),
                })?
                .ok_or_else(|| CodecError::DecodeChild {
                    index,
                    reason: "inline child is the empty node".to_string(),
                })?;
            descendants += 1 + child.descendants();
            *slot = Some(NodeHandle::InMemory(Arc::new(child)));
        }
    }

    Ok(Node::Branch(BranchNode {
        partial_key,
        value,
        children: Box::new(children),
        generation: 0,
        dirty: false,
        merkle_value: None,
        descendants,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TrieVersion;
    use crate::node::encode::encode_node;
    use crate::node::header::NodeVariant;
    use crate::scale::write_byte_slice;

    fn scale_bytes(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_byte_slice(data, &mut out);
        out
    }

    #[test]
    fn test_decode_no_data() {
        assert_eq!(decode_node_bytes(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_decode_unknown_variant() {
        assert_eq!(
            decode_node_bytes(&[0b0000_1000]),
            Err(CodecError::UnknownVariant(0b0000_1000))
        );
    }

    #[test]
    fn test_decode_empty_node() {
        assert_eq!(decode_node_bytes(&[0x00]).unwrap(), None);
    }

    #[test]
    fn test_decode_leaf() {
        let mut data = vec![NodeVariant::Leaf.bits() | 1, 0x09];
        data.extend_from_slice(&scale_bytes(&[1, 2, 3]));

        let node = decode_node_bytes(&data).unwrap().unwrap();
        assert_eq!(node.partial_key(), &[9]);
        assert_eq!(
            node.value(),
            Some(&NodeValue::Inline(Bytes::from_static(&[1, 2, 3])))
        );
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_decode_leaf_missing_key_data() {
        let data = [NodeVariant::Leaf.bits() | 1];
        assert_eq!(decode_node_bytes(&data), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn test_decode_leaf_empty_value() {
        let data = [NodeVariant::Leaf.bits() | 1, 0x09, 0x00];
        let node = decode_node_bytes(&data).unwrap().unwrap();
        assert_eq!(node.value(), Some(&NodeValue::Inline(Bytes::new())));
    }

    #[test]
    fn test_decode_leaf_bad_compact_prefix() {
        let data = [NodeVariant::Leaf.bits() | 1, 0x09, 255, 255];
        assert_eq!(
            decode_node_bytes(&data),
            Err(CodecError::UnknownCompactPrefix(255))
        );
    }

    #[test]
    fn test_decode_branch_no_children() {
        let data = [NodeVariant::Branch.bits() | 1, 0x09, 0x00, 0x00];
        let node = decode_node_bytes(&data).unwrap().unwrap();
        assert_eq!(node.partial_key(), &[9]);
        assert_eq!(node.value(), None);
        assert_eq!(node.as_branch().num_children(), 0);
    }

    #[test]
    fn test_decode_branch_missing_bitmap() {
        let data = [NodeVariant::Branch.bits() | 1, 0x09];
        assert_eq!(
            decode_node_bytes(&data),
            Err(CodecError::ReadChildrenBitmap)
        );
    }

    #[test]
    fn test_decode_branch_with_hashed_child() {
        let child_hash: Vec<u8> = (0..32).collect();
        let mut data = vec![NodeVariant::Branch.bits() | 1, 0x09, 0x00, 0x04];
        data.extend_from_slice(&scale_bytes(&child_hash));

        let node = decode_node_bytes(&data).unwrap().unwrap();
        let branch = node.as_branch();
        assert_eq!(branch.num_children(), 1);
        assert_eq!(
            branch.children[10].as_ref().and_then(NodeHandle::as_hash),
            Some(Hash256::from_slice(&child_hash).unwrap())
        );
        assert_eq!(node.descendants(), 1);
    }

    #[test]
    fn test_decode_branch_missing_child_field() {
        let data = [NodeVariant::Branch.bits() | 1, 0x09, 0x00, 0x04];
        assert!(matches!(
            decode_node_bytes(&data),
            Err(CodecError::DecodeChild { index: 10, .. })
        ));
    }

    #[test]
    fn test_decode_branch_with_value_and_child() {
        let child_hash: Vec<u8> = (0..32).collect();
        let mut data = vec![NodeVariant::BranchWithValue.bits() | 1, 0x09, 0x00, 0x04];
        data.extend_from_slice(&scale_bytes(&[7, 8, 9]));
        data.extend_from_slice(&scale_bytes(&child_hash));

        let node = decode_node_bytes(&data).unwrap().unwrap();
        assert_eq!(
            node.value(),
            Some(&NodeValue::Inline(Bytes::from_static(&[7, 8, 9])))
        );
        assert_eq!(node.as_branch().num_children(), 1);
    }

    #[test]
    fn test_decode_hashed_value_variants() {
        let value_hash: Vec<u8> = (100..132).collect();

        let mut leaf_data = vec![NodeVariant::LeafWithHashedValue.bits() | 1, 0x09];
        leaf_data.extend_from_slice(&value_hash);
        let leaf = decode_node_bytes(&leaf_data).unwrap().unwrap();
        assert_eq!(
            leaf.value(),
            Some(&NodeValue::Hashed(Hash256::from_slice(&value_hash).unwrap()))
        );

        let mut branch_data = vec![
            NodeVariant::BranchWithHashedValue.bits() | 1,
            0x09,
            0x00,
            0x00,
        ];
        branch_data.extend_from_slice(&value_hash);
        let branch = decode_node_bytes(&branch_data).unwrap().unwrap();
        assert_eq!(
            branch.value(),
            Some(&NodeValue::Hashed(Hash256::from_slice(&value_hash).unwrap()))
        );
    }

    #[test]
    fn test_decode_hashed_value_too_short() {
        let mut data = vec![NodeVariant::LeafWithHashedValue.bits() | 1, 0x09];
        data.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            decode_node_bytes(&data),
            Err(CodecError::HashedValueTooShort {
                expected: 32,
                got: 3
            })
        );
    }

    #[test]
    fn test_decode_branch_with_inlined_branch_and_leaf() {
        // Bottom-level leaf, inlined in a mid-level branch, inlined in the
        // top-level branch next to another inline leaf.
        let mut bottom_leaf = vec![NodeVariant::Leaf.bits() | 1, 0x04];
        bottom_leaf.extend_from_slice(&scale_bytes(&[4]));

        let mut mid_branch = vec![NodeVariant::BranchWithValue.bits() | 1, 0x03, 0x01, 0x00];
        mid_branch.extend_from_slice(&scale_bytes(&[3]));
        mid_branch.extend_from_slice(&scale_bytes(&bottom_leaf));

        let mut top_leaf = vec![NodeVariant::Leaf.bits() | 1, 0x02];
        top_leaf.extend_from_slice(&scale_bytes(&[2]));

        let mut data = vec![NodeVariant::Branch.bits() | 1, 0x01, 0x03, 0x00];
        data.extend_from_slice(&scale_bytes(&top_leaf));
        data.extend_from_slice(&scale_bytes(&mid_branch));

        let node = decode_node_bytes(&data).unwrap().unwrap();
        assert_eq!(node.partial_key(), &[1]);
        assert_eq!(node.descendants(), 3);

        let branch = node.as_branch();
        let child0 = branch.children[0].as_ref().and_then(NodeHandle::as_node).unwrap();
        assert_eq!(child0.partial_key(), &[2]);

        let child1 = branch.children[1].as_ref().and_then(NodeHandle::as_node).unwrap();
        assert_eq!(child1.partial_key(), &[3]);
        assert_eq!(child1.descendants(), 1);

        // The decoded tree re-encodes to the identical bytes.
        assert_eq!(encode_node(&node, TrieVersion::V0).unwrap(), data);
    }

    #[test]
    fn test_decode_odd_partial_key_roundtrip() {
        let leaf = Node::new_leaf(vec![0xa, 0xb, 0xc], NodeValue::Inline(Bytes::from_static(&[1])), 0);
        let encoded = encode_node(&leaf, TrieVersion::V0).unwrap();
        let decoded = decode_node_bytes(&encoded).unwrap().unwrap();
        assert_eq!(decoded.partial_key(), &[0xa, 0xb, 0xc]);
        assert_eq!(encode_node(&decoded, TrieVersion::V0).unwrap(), encoded);
    }
}
