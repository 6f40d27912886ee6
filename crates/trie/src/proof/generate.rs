//! Proof generation.
//!
//! For each requested key (sorted, deduplicated) the generator performs a
//! recorded lookup against the store and walks the recorded nodes while
//! maintaining a stack of in-progress ancestors. When the next key diverges
//! from the stack, popped entries are re-encoded — values of requested keys
//! omitted, descended children blanked — into their reserved output slots.
//! The proof lists node encodings in visit order, root first.

use std::sync::{Arc, Mutex};

use filament_primitives::Hash256;

use crate::database::DbGetter;
use crate::error::ProofError;
use crate::layout::{empty_trie_hash, TrieVersion};
use crate::nibbles::key_to_nibbles;
use crate::node::{NodeHandle, CHILDREN_CAPACITY};
use crate::proof::{
    decode_proof_node, encode_branch_parts, encode_leaf_parts, wire_child_to_reference,
    ChildReference, EncodedProofNode, EncodedValue, WireChild,
};
use crate::recorder::{RecordedNodesIter, Recorder};
use crate::trie::Trie;

/// One in-progress ancestor on the generation stack.
struct StackEntry {
    /// Nibble path from the root to this node.
    prefix: Vec<u8>,
    /// The decoded node, child fields as on the wire.
    node: EncodedProofNode,
    /// The node's original encoding.
    encoding: Vec<u8>,
    /// The digest the node was fetched under, `None` when inline.
    node_hash: Option<Hash256>,
    /// Whether the node's value belongs to a requested key and is omitted.
    omit_value: bool,
    /// Next child slot to complete.
    child_index: usize,
    /// Rebuilt child references for slots already passed.
    children: [Option<ChildReference>; CHILDREN_CAPACITY],
    /// Reserved slot in the output proof, `None` when inline.
    output_index: Option<usize>,
}

impl StackEntry {
    fn new(
        prefix: Vec<u8>,
        encoding: Vec<u8>,
        node_hash: Option<Hash256>,
        output_index: Option<usize>,
    ) -> Result<Self, ProofError> {
        let node = decode_proof_node(&encoding)?;
        Ok(Self {
            prefix,
            node,
            encoding,
            node_hash,
            omit_value: false,
            child_index: 0,
            children: std::array::from_fn(|_| None),
            output_index,
        })
    }

    /// Advances the child cursor to `target`, carrying over the wire
    /// references of the slots skipped.
    fn advance_child_index(&mut self, target: usize) {
        let EncodedProofNode::Branch { children, .. } = &self.node else {
            panic!("only branches have children to advance over");
        };
        debug_assert!(target >= self.child_index, "requested keys are sorted");
        for index in self.child_index..target {
            if let Some(child) = &children[index] {
                self.children[index] = Some(wire_child_to_reference(child));
            }
        }
        self.child_index = target;
    }

    /// Records the re-encoding of the child just popped off the stack:
    /// hash-referenced children are blanked (the verifier recomputes them),
    /// inline children carry their re-encoded bytes.
    fn set_child(&mut self, encoded_child: Vec<u8>) {
        let EncodedProofNode::Branch { children, .. } = &self.node else {
            panic!("only branches have children to set");
        };
        let replacement = match &children[self.child_index] {
            Some(WireChild::Hash(_)) => ChildReference::Inline(Vec::new()),
            Some(WireChild::Inline(_)) => ChildReference::Inline(encoded_child),
            None => panic!("descended into an absent child slot"),
        };
        self.children[self.child_index] = Some(replacement);
        self.child_index += 1;
    }

    /// Re-encodes the entry for the output proof.
    fn encode(&mut self) -> Vec<u8> {
        match &self.node {
            EncodedProofNode::Empty => self.encoding.clone(),
            EncodedProofNode::Leaf { partial_key, .. } => {
                if !self.omit_value {
                    return self.encoding.clone();
                }
                encode_leaf_parts(partial_key, &EncodedValue::Inline(Vec::new()))
            }
            EncodedProofNode::Branch {
                partial_key, value, ..
            } => {
                let partial_key = partial_key.clone();
                let value = if self.omit_value { None } else { value.clone() };
                self.advance_child_index(CHILDREN_CAPACITY);
                encode_branch_parts(&partial_key, value.as_ref(), &self.children)
            }
        }
    }
}

/// The next move while matching a key against the stack top.
enum Step {
    /// Descend into a child.
    Descend {
        child_prefix_len: usize,
        child: DescendTarget,
    },
    /// The key's lookup is finished (found or proven absent).
    Done,
}

enum DescendTarget {
    Hash(Hash256),
    Inline(Vec<u8>),
}

/// Generates a proof for `keys` against the trie rooted at `root_hash` in
/// the given store.
pub fn generate_proof(
    db: Arc<dyn DbGetter + Send + Sync>,
    version: TrieVersion,
    root_hash: Hash256,
    keys: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, ProofError> {
    if root_hash == empty_trie_hash() {
        return Ok(vec![crate::proof::encode_empty_proof_node()]);
    }

    let mut keys = keys.to_vec();
    keys.sort();
    keys.dedup();

    let mut stack: Vec<StackEntry> = Vec::new();
    let mut proof_nodes: Vec<Option<Vec<u8>>> = Vec::new();

    for key in &keys {
        let key_nibbles = key_to_nibbles(key);
        unwind_stack(&mut stack, &mut proof_nodes, Some(&key_nibbles));

        // Record the lookup path for this key.
        let recorder = Arc::new(Mutex::new(Recorder::new()));
        let mut trie = Trie::new(version)
            .with_db(db.clone())
            .with_recorder(recorder.clone());
        trie.root = Some(NodeHandle::Hashed(root_hash));
        trie.get(key)?;
        let mut recorded =
            RecordedNodesIter::new(recorder.lock().expect("lock poisoned").drain());

        // Skip records for ancestors already on the stack.
        for entry in &stack {
            let matches = match (entry.node_hash, recorded.peek()) {
                (Some(hash), Some(record)) => record.hash == hash,
                _ => false,
            };
            if !matches {
                break;
            }
            recorded.next();
        }

        // Descend, pushing recorded nodes until the value (or its absence)
        // is reached.
        loop {
            let step = match stack.last_mut() {
                None => Step::Descend {
                    child_prefix_len: 0,
                    child: DescendTarget::Hash(root_hash),
                },
                Some(entry) => match_key_to_node(entry, &key_nibbles, &mut recorded)?,
            };

            match step {
                Step::Descend {
                    child_prefix_len,
                    child,
                } => {
                    let child_prefix = key_nibbles[..child_prefix_len].to_vec();
                    let entry = match child {
                        DescendTarget::Hash(hash) => {
                            let record = recorded.next().unwrap_or_else(|| {
                                panic!("lookup did not record node {hash}")
                            });
                            assert_eq!(record.hash, hash, "recorded node out of order");
                            let output_index = proof_nodes.len();
                            // Reserve the output slot; it is filled when this
                            // entry is popped.
                            proof_nodes.push(None);
                            StackEntry::new(
                                child_prefix,
                                record.data.clone(),
                                Some(hash),
                                Some(output_index),
                            )?
                        }
                        DescendTarget::Inline(data) => {
                            if data.len() > Hash256::LENGTH {
                                return Err(ProofError::InvalidChildReference(data.len()));
                            }
                            StackEntry::new(child_prefix, data, None, None)?
                        }
                    };
                    stack.push(entry);
                }
                Step::Done => break,
            }
        }
    }

    unwind_stack(&mut stack, &mut proof_nodes, None);
    Ok(proof_nodes
        .into_iter()
        .map(|slot| slot.expect("every reserved slot is filled on unwind"))
        .collect())
}

/// Pops entries whose prefix no longer covers `maybe_key` (all of them when
/// `None`), wiring each popped encoding into its parent and output slot.
fn unwind_stack(
    stack: &mut Vec<StackEntry>,
    proof_nodes: &mut [Option<Vec<u8>>],
    maybe_key: Option<&[u8]>,
) {
    while let Some(mut entry) = stack.pop() {
        if let Some(key) = maybe_key {
            if key.starts_with(&entry.prefix) {
                stack.push(entry);
                break;
            }
        }

        let encoded = entry.encode();
        if let Some(parent) = stack.last_mut() {
            parent.set_child(encoded.clone());
        }
        if let Some(index) = entry.output_index {
            proof_nodes[index] = Some(encoded);
        }
    }
}

/// Matches the key against the stack-top node, deciding the next step and
/// flagging values to omit.
fn match_key_to_node(
    entry: &mut StackEntry,
    key: &[u8],
    recorded: &mut RecordedNodesIter,
) -> Result<Step, ProofError> {
    let prefix_len = entry.prefix.len();
    match &entry.node {
        EncodedProofNode::Empty => Ok(Step::Done),
        EncodedProofNode::Leaf { partial_key, value } => {
            let exact = key.len() == prefix_len + partial_key.len()
                && key[prefix_len..] == partial_key[..];
            if exact {
                entry.omit_value = true;
                if matches!(value, EncodedValue::Hashed(_)) {
                    // The lookup recorded the value preimage right after the
                    // leaf; consume it so the next key starts aligned.
                    recorded.next();
                }
            }
            Ok(Step::Done)
        }
        EncodedProofNode::Branch {
            partial_key,
            value,
            children,
        } => {
            if !key[prefix_len.min(key.len())..].starts_with(partial_key) {
                return Ok(Step::Done);
            }
            let children_start = prefix_len + partial_key.len();
            if key.len() == children_start {
                if value.is_some() {
                    entry.omit_value = true;
                    if matches!(value, Some(EncodedValue::Hashed(_))) {
                        recorded.next();
                    }
                }
                return Ok(Step::Done);
            }

            let index = usize::from(key[children_start]);
            let child = children[index].clone();
            entry.advance_child_index(index);
            match child {
                None => Ok(Step::Done),
                Some(WireChild::Hash(hash)) => Ok(Step::Descend {
                    child_prefix_len: children_start + 1,
                    child: DescendTarget::Hash(hash),
                }),
                Some(WireChild::Inline(data)) => Ok(Step::Descend {
                    child_prefix_len: children_start + 1,
                    child: DescendTarget::Inline(data),
                }),
            }
        }
    }
}
