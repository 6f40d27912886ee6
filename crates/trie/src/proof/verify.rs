//! Proof verification.
//!
//! Verification walks the proof nodes exactly as generation laid them out,
//! substituting each claimed value back into the node that should carry it,
//! rebuilding child references bottom-up, and finally comparing the
//! recomputed root digest with the claimed one. Extraneous material, missing
//! nodes, duplicate keys and value disagreements are each distinct errors so
//! that fraud is never mistaken for unavailability.

use filament_primitives::Hash256;

use crate::error::ProofError;
use crate::layout::TrieVersion;
use crate::nibbles::key_to_nibbles;
use crate::node::CHILDREN_CAPACITY;
use crate::proof::{
    decode_proof_node, encode_branch_parts, encode_leaf_parts, wire_child_to_reference,
    ChildReference, EncodedProofNode, EncodedValue, WireChild,
};

/// One key and the value the caller claims for it (`None` claims absence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofItem {
    /// The key being proven.
    pub key: Vec<u8>,
    /// The expected value, or `None` for proven absence.
    pub value: Option<Vec<u8>>,
}

impl ProofItem {
    /// A membership item.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A non-membership item.
    pub fn absent(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

struct Item {
    key: Vec<u8>,
    nibbles: Vec<u8>,
    value: Option<Vec<u8>>,
}

struct StackEntry {
    prefix: Vec<u8>,
    node: EncodedProofNode,
    /// The value to re-encode with, already in wire form.
    value: Option<EncodedValue>,
    is_inline: bool,
    child_index: usize,
    children: [Option<ChildReference>; CHILDREN_CAPACITY],
}

impl StackEntry {
    fn new(data: &[u8], prefix: Vec<u8>, is_inline: bool) -> Result<Self, ProofError> {
        let node = decode_proof_node(data)?;
        let value = match &node {
            EncodedProofNode::Empty => None,
            EncodedProofNode::Leaf { value, .. } => Some(value.clone()),
            EncodedProofNode::Branch { value, .. } => value.clone(),
        };
        Ok(Self {
            prefix,
            node,
            value,
            is_inline,
            child_index: 0,
            children: std::array::from_fn(|_| None),
        })
    }

    /// Substitutes a claimed value, hashing it when the layout stores it out
    /// of line.
    fn set_value(&mut self, value: &[u8], version: TrieVersion) {
        self.value = Some(if version.should_hash_value(value.len()) {
            EncodedValue::Hashed(version.hash(value))
        } else {
            EncodedValue::Inline(value.to_vec())
        });
    }

    /// Re-encodes the entry with its substituted value and rebuilt children.
    fn encode(&mut self) -> Vec<u8> {
        match &self.node {
            EncodedProofNode::Empty => crate::proof::encode_empty_proof_node(),
            EncodedProofNode::Leaf { partial_key, .. } => {
                let value = self
                    .value
                    .clone()
                    .unwrap_or(EncodedValue::Inline(Vec::new()));
                encode_leaf_parts(partial_key, &value)
            }
            EncodedProofNode::Branch { partial_key, .. } => {
                let partial_key = partial_key.clone();
                let value = self.value.clone();
                self.advance_child_index(CHILDREN_CAPACITY);
                encode_branch_parts(&partial_key, value.as_ref(), &self.children)
            }
        }
    }

    fn advance_child_index(&mut self, target: usize) {
        let EncodedProofNode::Branch { children, .. } = &self.node else {
            panic!("only branches have children to advance over");
        };
        for index in self.child_index..target {
            if let Some(child) = &children[index] {
                self.children[index] = Some(wire_child_to_reference(child));
            }
        }
        self.child_index = target;
    }
}

/// How a claimed key relates to the node under inspection.
enum ValueMatch {
    /// The key lands exactly on a leaf; its value must be claimed present.
    MatchesLeaf,
    /// The key lands exactly on a branch; the claim decides the value.
    MatchesBranch,
    /// The key has no slot in the trie; it must be claimed absent.
    NotFound,
    /// The key lands on a node whose value the prover failed to omit.
    NotOmitted,
    /// The key continues below the child at the returned prefix.
    IsChild(Vec<u8>),
}

fn match_key_to_node(key: &[u8], prefix_len: usize, node: &EncodedProofNode) -> ValueMatch {
    match node {
        EncodedProofNode::Empty => ValueMatch::NotFound,
        EncodedProofNode::Leaf { partial_key, value } => {
            let exact = key.len() == prefix_len + partial_key.len()
                && key[prefix_len..] == partial_key[..];
            if !exact {
                return ValueMatch::NotFound;
            }
            match value {
                EncodedValue::Inline(data) if data.is_empty() => ValueMatch::MatchesLeaf,
                // A requested key's value must have been omitted.
                _ => ValueMatch::NotOmitted,
            }
        }
        EncodedProofNode::Branch {
            partial_key,
            value,
            children,
        } => {
            if !key[prefix_len.min(key.len())..].starts_with(partial_key) {
                return ValueMatch::NotFound;
            }
            let children_start = prefix_len + partial_key.len();
            if key.len() == children_start {
                return match value {
                    None => ValueMatch::MatchesBranch,
                    Some(_) => ValueMatch::NotOmitted,
                };
            }
            let index = usize::from(key[children_start]);
            if children[index].is_some() {
                ValueMatch::IsChild(key[..children_start + 1].to_vec())
            } else {
                ValueMatch::NotFound
            }
        }
    }
}

enum Step {
    Descend(Vec<u8>),
    Unwind,
}

/// Verifies `proof` against the claimed `root` for the given items.
///
/// Items are sorted internally; duplicate keys are an error. An empty item
/// set only accepts an empty proof.
pub fn verify_proof(
    version: TrieVersion,
    root: Hash256,
    proof: &[Vec<u8>],
    items: &[ProofItem],
) -> Result<(), ProofError> {
    let mut items: Vec<Item> = items
        .iter()
        .map(|item| Item {
            key: item.key.clone(),
            nibbles: key_to_nibbles(&item.key),
            value: item.value.clone(),
        })
        .collect();
    items.sort_by(|a, b| a.key.cmp(&b.key));

    if items.is_empty() {
        if proof.is_empty() {
            return Ok(());
        }
        return Err(ProofError::ExtraneousNode);
    }
    for pair in items.windows(2) {
        if pair[0].key == pair[1].key {
            return Err(ProofError::DuplicateKey {
                key: pair[0].key.clone(),
            });
        }
    }

    let mut proof_iter = proof.iter();
    let mut items_iter = items.iter().peekable();
    let mut stack: Vec<StackEntry> = Vec::new();

    let root_node = proof_iter.next().ok_or(ProofError::IncompleteProof)?;
    let mut last_entry = StackEntry::new(root_node, Vec::new(), false)?;

    loop {
        let step = advance_item(&mut last_entry, &mut items_iter, version)?;

        match step {
            Step::Descend(child_prefix) => {
                let next_entry = advance_child_entry(&mut last_entry, child_prefix, &mut proof_iter)?;
                stack.push(last_entry);
                last_entry = next_entry;
            }
            Step::Unwind => {
                let is_inline = last_entry.is_inline;
                let node_data = last_entry.encode();

                let child_ref = if is_inline {
                    if node_data.len() > Hash256::LENGTH {
                        return Err(ProofError::InvalidChildReference(node_data.len()));
                    }
                    ChildReference::Inline(node_data)
                } else {
                    ChildReference::Hash(version.hash(&node_data))
                };

                match stack.pop() {
                    Some(mut parent) => {
                        parent.children[parent.child_index] = Some(child_ref);
                        parent.child_index += 1;
                        last_entry = parent;
                    }
                    None => {
                        if proof_iter.next().is_some() {
                            return Err(ProofError::ExtraneousNode);
                        }
                        let computed = match child_ref {
                            ChildReference::Hash(hash) => hash,
                            ChildReference::Inline(_) => {
                                unreachable!("the root entry is never inline")
                            }
                        };
                        if computed != root {
                            return Err(ProofError::RootMismatch {
                                computed,
                                expected: root,
                            });
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Consumes items that land on the current entry, returning the next move.
fn advance_item<'a>(
    entry: &mut StackEntry,
    items: &mut std::iter::Peekable<std::slice::Iter<'a, Item>>,
    version: TrieVersion,
) -> Result<Step, ProofError> {
    while let Some(item) = items.peek() {
        if !item.nibbles.starts_with(&entry.prefix) {
            return Ok(Step::Unwind);
        }

        match match_key_to_node(&item.nibbles, entry.prefix.len(), &entry.node) {
            ValueMatch::MatchesLeaf => match &item.value {
                Some(value) => entry.set_value(value, version),
                None => {
                    return Err(ProofError::ValueMismatch {
                        key: item.key.clone(),
                    })
                }
            },
            ValueMatch::MatchesBranch => match &item.value {
                Some(value) => entry.set_value(value, version),
                None => entry.value = None,
            },
            ValueMatch::NotFound => {
                if item.value.is_some() {
                    return Err(ProofError::ValueMismatch {
                        key: item.key.clone(),
                    });
                }
            }
            ValueMatch::NotOmitted => {
                return Err(ProofError::ExtraneousValue {
                    key: item.key.clone(),
                })
            }
            ValueMatch::IsChild(child_prefix) => return Ok(Step::Descend(child_prefix)),
        }

        items.next();
    }
    Ok(Step::Unwind)
}

/// Builds the stack entry for the child at `child_prefix`, pulling the next
/// proof node when the child was omitted.
fn advance_child_entry<'a>(
    entry: &mut StackEntry,
    child_prefix: Vec<u8>,
    proof_iter: &mut std::slice::Iter<'a, Vec<u8>>,
) -> Result<StackEntry, ProofError> {
    let target = usize::from(*child_prefix.last().expect("child prefix is never empty"));
    entry.advance_child_index(target);

    let EncodedProofNode::Branch { children, .. } = &entry.node else {
        panic!("descend target is always a branch");
    };
    match &children[target] {
        Some(WireChild::Inline(data)) => {
            if data.is_empty() {
                // Omitted child: materialize it from the proof stream.
                let node_data = proof_iter.next().ok_or(ProofError::IncompleteProof)?;
                StackEntry::new(node_data, child_prefix, false)
            } else {
                StackEntry::new(data, child_prefix, true)
            }
        }
        Some(WireChild::Hash(hash)) => {
            // Nodes on the path to a requested key must travel in the proof,
            // not as bare references.
            Err(ProofError::ExtraneousHashReference(*hash))
        }
        None => panic!("descend target child is present by construction"),
    }
}
