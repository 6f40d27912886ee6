//! The trie handle and mutation engine.
//!
//! A [`Trie`] owns a node graph through copy-on-write handles. Mutations
//! require `&mut self` and are not internally synchronized; concurrency is
//! obtained through [`Trie::snapshot`], which shares all nodes read-only and
//! copies a node the first time either handle rewrites it. Lookups resolve
//! lazily referenced nodes through the attached backing store, consulting the
//! cache and feeding the recorder when present.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use filament_primitives::Hash256;
use hashbrown::HashMap;

use crate::cache::TrieCache;
use crate::database::DbGetter;
use crate::deltas::Deltas;
use crate::error::TrieError;
use crate::layout::{empty_trie_hash, TrieVersion};
use crate::nibbles::{key_to_nibbles, nibbles_to_key, NibblePath};
use crate::node::encode::encode_node;
use crate::node::merkle::{encode_and_hash_root, merkle_value};
use crate::node::{BranchNode, Node, NodeHandle, NodeValue};
use crate::recorder::Recorder;

/// A Merkle-Patricia trie mapping byte keys to byte values.
pub struct Trie {
    pub(crate) generation: u64,
    pub(crate) root: Option<NodeHandle>,
    pub(crate) version: TrieVersion,
    pub(crate) deltas: Deltas,
    pub(crate) child_tries: HashMap<Hash256, Trie>,
    pub(crate) db: Option<Arc<dyn DbGetter + Send + Sync>>,
    pub(crate) cache: Option<Arc<TrieCache>>,
    pub(crate) recorder: Option<Arc<Mutex<Recorder>>>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new(TrieVersion::default())
    }
}

impl std::fmt::Debug for Trie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("generation", &self.generation)
            .field("version", &self.version)
            .field("has_root", &self.root.is_some())
            .field("child_tries", &self.child_tries.len())
            .finish()
    }
}

impl Trie {
    /// An empty trie using the given layout version.
    pub fn new(version: TrieVersion) -> Self {
        Self {
            generation: 0,
            root: None,
            version,
            deltas: Deltas::new(),
            child_tries: HashMap::new(),
            db: None,
            cache: None,
            recorder: None,
        }
    }

    /// Attaches a backing store for resolving lazily referenced nodes and
    /// out-of-line values.
    pub fn with_db(mut self, db: Arc<dyn DbGetter + Send + Sync>) -> Self {
        self.db = Some(db);
        self
    }

    /// Attaches a node/value cache consulted before the backing store.
    pub fn with_cache(mut self, cache: Arc<TrieCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches an access recorder capturing every store fetch.
    pub fn with_recorder(mut self, recorder: Arc<Mutex<Recorder>>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// The layout version of this trie.
    pub fn version(&self) -> TrieVersion {
        self.version
    }

    /// The current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the trie holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The accumulated deltas since the last flush.
    pub fn deltas(&self) -> &Deltas {
        &self.deltas
    }

    /// Returns a new handle sharing this trie's nodes and child tries.
    ///
    /// The new handle carries the next generation; a mutation on either
    /// handle copies any node it touches that is shared or tagged with an
    /// older generation, so the two evolve independently.
    pub fn snapshot(&self) -> Trie {
        let child_tries = self
            .child_tries
            .iter()
            .map(|(hash, child)| (*hash, child.snapshot()))
            .collect();
        Trie {
            generation: self.generation + 1,
            root: self.root.clone(),
            version: self.version,
            deltas: Deltas::new(),
            child_tries,
            db: self.db.clone(),
            cache: self.cache.clone(),
            recorder: None,
        }
    }

    /// The Merkle root digest, forcing any outstanding Merkle-value
    /// computation. The empty trie commits to the fixed empty digest.
    pub fn root_hash(&mut self) -> Result<Hash256, TrieError> {
        match &mut self.root {
            None => Ok(empty_trie_hash()),
            Some(NodeHandle::Hashed(hash)) => Ok(*hash),
            Some(NodeHandle::InMemory(node)) => {
                let (_, hash) = encode_and_hash_root(Arc::make_mut(node), self.version)?;
                Ok(hash)
            }
        }
    }

    /// [`Self::root_hash`] for call sites that treat failure as fatal.
    ///
    /// # Panics
    ///
    /// Panics if hashing fails, e.g. on a lazily loaded trie whose store
    /// lost a referenced node.
    pub fn must_root_hash(&mut self) -> Hash256 {
        self.root_hash()
            .unwrap_or_else(|err| panic!("hashing trie root: {err}"))
    }

    // --- lookups ---

    /// The value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, TrieError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let root = self.resolve_handle(root)?;
        self.retrieve(&root, NibblePath::new(key), key)
    }

    fn retrieve(
        &self,
        node: &Node,
        path: NibblePath<'_>,
        full_key: &[u8],
    ) -> Result<Option<Bytes>, TrieError> {
        match node {
            Node::Leaf(leaf) => {
                if path.len() == leaf.partial_key.len() && path.starts_with(&leaf.partial_key) {
                    self.resolve_value(&leaf.value, full_key).map(Some)
                } else {
                    Ok(None)
                }
            }
            Node::Branch(branch) => {
                let partial_key = &branch.partial_key;
                if path.len() == partial_key.len() && path.starts_with(partial_key) {
                    return match &branch.value {
                        Some(value) => self.resolve_value(value, full_key).map(Some),
                        None => Ok(None),
                    };
                }
                let common = path.common_prefix_len(partial_key);
                if common < partial_key.len() {
                    return Ok(None);
                }
                let index = usize::from(path.at(partial_key.len()));
                match &branch.children[index] {
                    None => Ok(None),
                    Some(child) => {
                        let child = self.resolve_handle(child)?;
                        self.retrieve(&child, path.mid(partial_key.len() + 1), full_key)
                    }
                }
            }
        }
    }

    /// Resolves a stored value to its bytes, fetching hashed values through
    /// the store. This is the only suspension point on the read path.
    pub(crate) fn resolve_value(
        &self,
        value: &NodeValue,
        full_key: &[u8],
    ) -> Result<Bytes, TrieError> {
        match value {
            NodeValue::Inline(bytes) => Ok(bytes.clone()),
            NodeValue::Hashed(hash) => {
                if self.recorder.is_none() {
                    if let Some(cache) = &self.cache {
                        if let Some(cached) = cache.get_value(full_key) {
                            // A stale entry cannot pass the digest check.
                            if self.version.hash(&cached) == *hash {
                                return Ok(cached);
                            }
                        }
                    }
                }
                let db = self.db.as_ref().ok_or(TrieError::NoDatabase)?;
                let bytes = db
                    .get(hash.as_bytes())
                    .map_err(|err| TrieError::Database(format!("getting value {hash}: {err}")))?
                    .ok_or(TrieError::IncompleteDatabase(*hash))?;
                if let Some(recorder) = &self.recorder {
                    recorder
                        .lock()
                        .expect("lock poisoned")
                        .record(*hash, bytes.clone());
                }
                let bytes = Bytes::from(bytes);
                if let Some(cache) = &self.cache {
                    cache.put_value(full_key, bytes.clone());
                }
                Ok(bytes)
            }
        }
    }

    /// Resolves a child handle to an in-memory node, fetching and decoding
    /// through the store when it is a digest reference.
    pub(crate) fn resolve_handle(&self, handle: &NodeHandle) -> Result<Arc<Node>, TrieError> {
        match handle {
            NodeHandle::InMemory(node) => Ok(node.clone()),
            NodeHandle::Hashed(hash) => self.fetch_node(*hash),
        }
    }

    fn fetch_node(&self, hash: Hash256) -> Result<Arc<Node>, TrieError> {
        // The recorder needs the raw encoding of every visited node, so a
        // recorded lookup always reads through the store.
        if self.recorder.is_none() {
            if let Some(cache) = &self.cache {
                if let Some(node) = cache.get_node(&hash) {
                    return Ok(node);
                }
            }
        }

        let db = self.db.as_ref().ok_or(TrieError::NoDatabase)?;
        let encoding = db
            .get(hash.as_bytes())
            .map_err(|err| TrieError::Database(format!("getting node {hash}: {err}")))?
            .ok_or(TrieError::IncompleteDatabase(hash))?;

        if let Some(recorder) = &self.recorder {
            recorder
                .lock()
                .expect("lock poisoned")
                .record(hash, encoding.clone());
        }

        let mut node = crate::node::decode::decode_node_bytes(&encoding)
            .map_err(TrieError::Codec)?
            .ok_or_else(|| {
                TrieError::Database(format!("node {hash} stored as the empty node"))
            })?;
        // Fetched by digest, so the Merkle value is the digest itself.
        node.set_merkle_value(hash.to_vec());

        let node = Arc::new(node);
        if let Some(cache) = &self.cache {
            cache.put_node(hash, node.clone());
        }
        Ok(node)
    }

    // --- mutation plumbing ---

    fn unwrap_or_clone(node: Arc<Node>) -> Node {
        Arc::try_unwrap(node).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Records the digest of a clean node whose current persisted form is
    /// about to become unreachable. Dirty nodes were never persisted and
    /// inline Merkle values live inside their parent, so neither is recorded.
    pub(crate) fn register_node_deleted(
        &self,
        node: &Node,
        pending: &mut Deltas,
    ) -> Result<(), TrieError> {
        if node.is_dirty() {
            return Ok(());
        }
        let value = match node.cached_merkle_value() {
            Some(cached) => cached.to_vec(),
            None => {
                let encoding = encode_node(node, self.version)?;
                merkle_value(self.version, &encoding)
            }
        };
        if value.len() == Hash256::LENGTH {
            pending.record_deleted(Hash256::from_slice(&value).expect("length checked"));
        }
        Ok(())
    }

    /// Brings an owned node into the current generation and marks it dirty,
    /// recording its previous persisted digest first.
    fn prepare_for_mutation(&self, node: &mut Node, pending: &mut Deltas) -> Result<(), TrieError> {
        self.register_node_deleted(node, pending)?;
        node.set_generation(self.generation);
        node.set_dirty(true);
        Ok(())
    }

    /// Merges the operation's pending deltas on success; drops them on
    /// failure. Nothing is tracked before the first snapshot, since there is
    /// no older persisted state to prune.
    pub(crate) fn handle_tracked_deltas(&mut self, success: bool, pending: Deltas) {
        if !success || self.generation == 0 {
            return;
        }
        self.deltas.merge_with(pending);
    }

    fn recompute_descendants(branch: &mut BranchNode) {
        branch.descendants = branch
            .children
            .iter()
            .flatten()
            .map(|child| match child {
                NodeHandle::InMemory(node) => 1 + node.descendants(),
                NodeHandle::Hashed(_) => 1,
            })
            .sum();
    }

    fn wrap(node: Node) -> NodeHandle {
        NodeHandle::InMemory(Arc::new(node))
    }

    // --- put ---

    /// Inserts `value` under `key`, replacing any existing value.
    ///
    /// Re-inserting a byte-identical value dirties nothing.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        log::trace!("put: key 0x{} ({} value bytes)", hex::encode(key), value.len());
        let mut pending = Deltas::new();
        let root = self.root.take();
        let result = self.insert_at(root.as_ref(), NibblePath::new(key), value, &mut pending);
        match result {
            Ok((new_root, _)) => {
                self.root = Some(new_root);
                self.handle_tracked_deltas(true, pending);
                Ok(())
            }
            Err(err) => {
                self.root = root;
                self.handle_tracked_deltas(false, pending);
                Err(err)
            }
        }
    }

    fn insert_at(
        &self,
        parent: Option<&NodeHandle>,
        path: NibblePath<'_>,
        value: &[u8],
        pending: &mut Deltas,
    ) -> Result<(NodeHandle, bool), TrieError> {
        let Some(handle) = parent else {
            let leaf = Node::new_leaf(
                path.to_nibbles(),
                NodeValue::Inline(Bytes::copy_from_slice(value)),
                self.generation,
            );
            return Ok((Self::wrap(leaf), true));
        };

        let node = self.resolve_handle(handle)?;
        match &*node {
            Node::Leaf(_) => self.insert_in_leaf(node, path, value, pending),
            Node::Branch(_) => self.insert_in_branch(node, path, value, pending),
        }
    }

    fn insert_in_leaf(
        &self,
        node: Arc<Node>,
        path: NibblePath<'_>,
        value: &[u8],
        pending: &mut Deltas,
    ) -> Result<(NodeHandle, bool), TrieError> {
        let Node::Leaf(leaf) = &*node else {
            unreachable!("caller dispatched on the leaf kind")
        };
        let partial_key = leaf.partial_key.clone();

        if path.len() == partial_key.len() && path.starts_with(&partial_key) {
            if leaf.value.equals_bytes(value, self.version) {
                return Ok((NodeHandle::InMemory(node), false));
            }
            let mut owned = Self::unwrap_or_clone(node);
            self.prepare_for_mutation(&mut owned, pending)?;
            if let Node::Leaf(leaf) = &mut owned {
                leaf.value = NodeValue::Inline(Bytes::copy_from_slice(value));
            }
            return Ok((Self::wrap(owned), true));
        }

        // The keys diverge: branch out at the longest common prefix.
        let common = path.common_prefix_len(&partial_key);
        let mut branch = Node::new_branch(path.to_nibbles()[..common].to_vec(), None, self.generation);
        let branch_inner = branch.as_branch_mut();

        if path.len() == common {
            // The new key ends at the branch; the old leaf hangs below it.
            branch_inner.value = Some(NodeValue::Inline(Bytes::copy_from_slice(value)));
            let child_index = usize::from(partial_key[common]);
            let mut old = Self::unwrap_or_clone(node);
            self.prepare_for_mutation(&mut old, pending)?;
            if let Node::Leaf(leaf) = &mut old {
                leaf.partial_key = partial_key[common + 1..].to_vec();
            }
            branch_inner.children[child_index] = Some(Self::wrap(old));
        } else if partial_key.len() == common {
            // The old leaf's key ends at the branch: its value is absorbed
            // and the leaf node itself disappears.
            self.register_node_deleted(&node, pending)?;
            branch_inner.value = Some(leaf.value.clone());
            let new_leaf = Node::new_leaf(
                path.mid(common + 1).to_nibbles(),
                NodeValue::Inline(Bytes::copy_from_slice(value)),
                self.generation,
            );
            branch_inner.children[usize::from(path.at(common))] = Some(Self::wrap(new_leaf));
        } else {
            let child_index = usize::from(partial_key[common]);
            let mut old = Self::unwrap_or_clone(node);
            self.prepare_for_mutation(&mut old, pending)?;
            if let Node::Leaf(leaf) = &mut old {
                leaf.partial_key = partial_key[common + 1..].to_vec();
            }
            branch_inner.children[child_index] = Some(Self::wrap(old));

            let new_leaf = Node::new_leaf(
                path.mid(common + 1).to_nibbles(),
                NodeValue::Inline(Bytes::copy_from_slice(value)),
                self.generation,
            );
            branch_inner.children[usize::from(path.at(common))] = Some(Self::wrap(new_leaf));
        }

        Self::recompute_descendants(branch.as_branch_mut());
        Ok((Self::wrap(branch), true))
    }

    fn insert_in_branch(
        &self,
        node: Arc<Node>,
        path: NibblePath<'_>,
        value: &[u8],
        pending: &mut Deltas,
    ) -> Result<(NodeHandle, bool), TrieError> {
        let Node::Branch(branch) = &*node else {
            unreachable!("caller dispatched on the branch kind")
        };
        let partial_key = branch.partial_key.clone();
        let common = path.common_prefix_len(&partial_key);

        if common == partial_key.len() {
            if path.len() == partial_key.len() {
                // Exact key match: update the branch's own value.
                if let Some(existing) = &branch.value {
                    if existing.equals_bytes(value, self.version) {
                        return Ok((NodeHandle::InMemory(node), false));
                    }
                }
                let mut owned = Self::unwrap_or_clone(node);
                self.prepare_for_mutation(&mut owned, pending)?;
                owned.as_branch_mut().value =
                    Some(NodeValue::Inline(Bytes::copy_from_slice(value)));
                return Ok((Self::wrap(owned), true));
            }

            let child_index = usize::from(path.at(partial_key.len()));
            let rest = path.mid(partial_key.len() + 1);
            let child = branch.children[child_index].clone();
            let (new_child, mutated) = self.insert_at(child.as_ref(), rest, value, pending)?;
            if !mutated {
                return Ok((NodeHandle::InMemory(node), false));
            }
            let mut owned = Self::unwrap_or_clone(node);
            self.prepare_for_mutation(&mut owned, pending)?;
            let branch_inner = owned.as_branch_mut();
            branch_inner.children[child_index] = Some(new_child);
            Self::recompute_descendants(branch_inner);
            return Ok((Self::wrap(owned), true));
        }

        // The partial keys diverge: a new branch takes the common prefix and
        // the old branch moves one nibble down.
        let mut new_branch =
            Node::new_branch(partial_key[..common].to_vec(), None, self.generation);
        let new_inner = new_branch.as_branch_mut();

        let old_index = usize::from(partial_key[common]);
        let mut old = Self::unwrap_or_clone(node);
        self.prepare_for_mutation(&mut old, pending)?;
        old.as_branch_mut().partial_key = partial_key[common + 1..].to_vec();
        new_inner.children[old_index] = Some(Self::wrap(old));

        if path.len() == common {
            new_inner.value = Some(NodeValue::Inline(Bytes::copy_from_slice(value)));
        } else {
            let new_leaf = Node::new_leaf(
                path.mid(common + 1).to_nibbles(),
                NodeValue::Inline(Bytes::copy_from_slice(value)),
                self.generation,
            );
            new_inner.children[usize::from(path.at(common))] = Some(Self::wrap(new_leaf));
        }

        Self::recompute_descendants(new_branch.as_branch_mut());
        Ok((Self::wrap(new_branch), true))
    }

    // --- delete ---

    /// Removes the value stored under `key`, if any.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        log::trace!("delete: key 0x{}", hex::encode(key));
        let mut pending = Deltas::new();
        let root = self.root.take();
        let result = self.delete_at(root.as_ref(), NibblePath::new(key), &mut pending);
        match result {
            Ok((new_root, _)) => {
                self.root = new_root;
                self.handle_tracked_deltas(true, pending);
                Ok(())
            }
            Err(err) => {
                self.root = root;
                self.handle_tracked_deltas(false, pending);
                Err(err)
            }
        }
    }

    fn delete_at(
        &self,
        parent: Option<&NodeHandle>,
        path: NibblePath<'_>,
        pending: &mut Deltas,
    ) -> Result<(Option<NodeHandle>, bool), TrieError> {
        let Some(handle) = parent else {
            return Ok((None, false));
        };
        let node = self.resolve_handle(handle)?;

        match &*node {
            Node::Leaf(leaf) => {
                if path.len() == leaf.partial_key.len() && path.starts_with(&leaf.partial_key) {
                    self.register_node_deleted(&node, pending)?;
                    Ok((None, true))
                } else {
                    Ok((Some(NodeHandle::InMemory(node)), false))
                }
            }
            Node::Branch(branch) => {
                let partial_key = branch.partial_key.clone();

                if path.len() == partial_key.len() && path.starts_with(&partial_key) {
                    // The key ends at this branch: remove its value.
                    if branch.value.is_none() {
                        return Ok((Some(NodeHandle::InMemory(node)), false));
                    }
                    let mut owned = Self::unwrap_or_clone(node);
                    self.prepare_for_mutation(&mut owned, pending)?;
                    owned.as_branch_mut().value = None;
                    let merged = self.handle_deletion(owned, pending)?;
                    return Ok((merged.map(Self::wrap), true));
                }

                let common = path.common_prefix_len(&partial_key);
                if common < partial_key.len() {
                    return Ok((Some(NodeHandle::InMemory(node)), false));
                }

                let child_index = usize::from(path.at(partial_key.len()));
                let Some(child) = branch.children[child_index].clone() else {
                    return Ok((Some(NodeHandle::InMemory(node)), false));
                };
                let (new_child, deleted) =
                    self.delete_at(Some(&child), path.mid(partial_key.len() + 1), pending)?;
                if !deleted {
                    return Ok((Some(NodeHandle::InMemory(node)), false));
                }

                let mut owned = Self::unwrap_or_clone(node);
                self.prepare_for_mutation(&mut owned, pending)?;
                let branch_inner = owned.as_branch_mut();
                branch_inner.children[child_index] = new_child;
                Self::recompute_descendants(branch_inner);
                let merged = self.handle_deletion(owned, pending)?;
                Ok((merged.map(Self::wrap), true))
            }
        }
    }

    /// Restores the branch invariants after a removal: a childless branch
    /// with a value becomes a leaf, a value-less branch with exactly one
    /// child merges with that child, and an empty branch disappears.
    fn handle_deletion(
        &self,
        node: Node,
        pending: &mut Deltas,
    ) -> Result<Option<Node>, TrieError> {
        let branch = match node {
            Node::Branch(branch) => branch,
            leaf => return Ok(Some(leaf)),
        };

        match (branch.num_children(), &branch.value) {
            (0, None) => Ok(None),
            (0, Some(value)) => Ok(Some(Node::new_leaf(
                branch.partial_key,
                value.clone(),
                self.generation,
            ))),
            (1, None) => {
                let child_index = branch
                    .first_child_index()
                    .expect("child count is exactly one");
                let child_handle = branch.children[child_index]
                    .as_ref()
                    .expect("slot holds the single child");
                let child = self.resolve_handle(child_handle)?;
                // The child is folded into its parent, so its own persisted
                // form becomes unreachable.
                self.register_node_deleted(&child, pending)?;

                let mut merged_key = branch.partial_key;
                merged_key.push(child_index as u8);
                merged_key.extend_from_slice(child.partial_key());

                match &*child {
                    Node::Leaf(child_leaf) => Ok(Some(Node::new_leaf(
                        merged_key,
                        child_leaf.value.clone(),
                        self.generation,
                    ))),
                    Node::Branch(child_branch) => {
                        let mut merged =
                            Node::new_branch(merged_key, child_branch.value.clone(), self.generation);
                        let inner = merged.as_branch_mut();
                        inner.children = child_branch.children.clone();
                        Self::recompute_descendants(inner);
                        Ok(Some(merged))
                    }
                }
            }
            _ => Ok(Some(Node::Branch(branch))),
        }
    }

    // --- clear prefix ---

    /// Expands a byte prefix to nibbles, trimming one trailing zero nibble so
    /// that a prefix ending in a zero half-byte matches both nibble parities.
    fn prefix_to_nibbles(prefix: &[u8]) -> Vec<u8> {
        let mut nibbles = key_to_nibbles(prefix);
        if nibbles.last() == Some(&0) {
            nibbles.pop();
        }
        nibbles
    }

    /// Deletes every key starting with `prefix`.
    pub fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        log::trace!("clear_prefix: 0x{}", hex::encode(prefix));
        let mut pending = Deltas::new();
        let result = self.clear_prefix_inner(prefix, &mut pending);
        let success = result.is_ok();
        self.handle_tracked_deltas(success, pending);
        result
    }

    fn clear_prefix_inner(&mut self, prefix: &[u8], pending: &mut Deltas) -> Result<(), TrieError> {
        if prefix.is_empty() {
            if let Some(root) = self.root.take() {
                self.register_subtree_deleted(&root, pending)?;
            }
            return Ok(());
        }

        let nibbles = Self::prefix_to_nibbles(prefix);
        let root = self.root.take();
        match self.clear_prefix_at(root.as_ref(), &nibbles, pending) {
            Ok((new_root, _)) => {
                self.root = new_root;
                Ok(())
            }
            Err(err) => {
                self.root = root;
                Err(err)
            }
        }
    }

    fn clear_prefix_at(
        &self,
        parent: Option<&NodeHandle>,
        prefix: &[u8],
        pending: &mut Deltas,
    ) -> Result<(Option<NodeHandle>, bool), TrieError> {
        let Some(handle) = parent else {
            return Ok((None, false));
        };
        let node = self.resolve_handle(handle)?;

        let partial_key = node.partial_key();
        let common = crate::nibbles::common_prefix_len(partial_key, prefix);

        if common == prefix.len() {
            // The whole subtree lives under the prefix.
            self.register_subtree_deleted(handle, pending)?;
            return Ok((None, true));
        }
        if common < partial_key.len() {
            return Ok((Some(NodeHandle::InMemory(node)), false));
        }

        let Node::Branch(branch) = &*node else {
            return Ok((Some(NodeHandle::InMemory(node)), false));
        };

        let child_index = usize::from(prefix[partial_key.len()]);
        let Some(child) = branch.children[child_index].clone() else {
            return Ok((Some(NodeHandle::InMemory(node)), false));
        };

        let rest = &prefix[partial_key.len() + 1..];
        let (new_child, changed) = if rest.is_empty() {
            // The prefix selects this child exactly: drop its whole subtree.
            self.register_subtree_deleted(&child, pending)?;
            (None, true)
        } else {
            self.clear_prefix_at(Some(&child), rest, pending)?
        };

        if !changed {
            return Ok((Some(NodeHandle::InMemory(node)), false));
        }

        let mut owned = Self::unwrap_or_clone(node);
        self.prepare_for_mutation(&mut owned, pending)?;
        let branch_inner = owned.as_branch_mut();
        branch_inner.children[child_index] = new_child;
        Self::recompute_descendants(branch_inner);
        let merged = self.handle_deletion(owned, pending)?;
        Ok((merged.map(Self::wrap), true))
    }

    /// Records the digests of every persisted node in a subtree about to be
    /// dropped, resolving lazy references so pruning sees the whole subtree.
    fn register_subtree_deleted(
        &self,
        handle: &NodeHandle,
        pending: &mut Deltas,
    ) -> Result<(), TrieError> {
        let node = self.resolve_handle(handle)?;
        self.register_node_deleted(&node, pending)?;
        if let Node::Branch(branch) = &*node {
            for child in branch.children.iter().flatten() {
                self.register_subtree_deleted(child, pending)?;
            }
        }
        Ok(())
    }

    /// Deletes values under `prefix`, lowest child index first, up to
    /// `limit`. Returns how many values were deleted and whether no matching
    /// value remains. A `limit` of zero deletes nothing.
    pub fn clear_prefix_limit(
        &mut self,
        prefix: &[u8],
        limit: u32,
    ) -> Result<(u32, bool), TrieError> {
        log::trace!("clear_prefix_limit: 0x{} limit {limit}", hex::encode(prefix));
        if limit == 0 {
            return Ok((0, false));
        }

        let mut pending = Deltas::new();
        let nibbles = Self::prefix_to_nibbles(prefix);
        let mut deleted = 0u32;
        let root = self.root.take();
        let result = self.clear_prefix_limit_at(root.as_ref(), &nibbles, limit, &mut deleted, &mut pending);
        match result {
            Ok((new_root, _, all_deleted)) => {
                self.root = new_root;
                self.handle_tracked_deltas(true, pending);
                Ok((deleted, all_deleted))
            }
            Err(err) => {
                self.root = root;
                self.handle_tracked_deltas(false, pending);
                Err(err)
            }
        }
    }

    fn clear_prefix_limit_at(
        &self,
        parent: Option<&NodeHandle>,
        prefix: &[u8],
        limit: u32,
        deleted: &mut u32,
        pending: &mut Deltas,
    ) -> Result<(Option<NodeHandle>, bool, bool), TrieError> {
        let Some(handle) = parent else {
            return Ok((None, false, true));
        };
        let node = self.resolve_handle(handle)?;

        let partial_key = node.partial_key().to_vec();
        let common = crate::nibbles::common_prefix_len(&partial_key, prefix);

        if common == prefix.len() {
            return self.delete_values_limit(node, limit, deleted, pending);
        }
        if common < partial_key.len() {
            return Ok((Some(NodeHandle::InMemory(node)), false, true));
        }

        let Node::Branch(branch) = &*node else {
            return Ok((Some(NodeHandle::InMemory(node)), false, true));
        };
        let child_index = usize::from(prefix[partial_key.len()]);
        let Some(child) = branch.children[child_index].clone() else {
            return Ok((Some(NodeHandle::InMemory(node)), false, true));
        };

        let rest = &prefix[partial_key.len() + 1..];
        let (new_child, changed, all_deleted) =
            self.clear_prefix_limit_at(Some(&child), rest, limit, deleted, pending)?;
        if !changed {
            return Ok((Some(NodeHandle::InMemory(node)), false, all_deleted));
        }

        let mut owned = Self::unwrap_or_clone(node);
        self.prepare_for_mutation(&mut owned, pending)?;
        let branch_inner = owned.as_branch_mut();
        branch_inner.children[child_index] = new_child;
        Self::recompute_descendants(branch_inner);
        let merged = self.handle_deletion(owned, pending)?;
        Ok((merged.map(Self::wrap), true, all_deleted))
    }

    /// Deletes values from a subtree in key order (the node's own value
    /// first, then children by ascending slot) until `limit` is reached.
    fn delete_values_limit(
        &self,
        node: Arc<Node>,
        limit: u32,
        deleted: &mut u32,
        pending: &mut Deltas,
    ) -> Result<(Option<NodeHandle>, bool, bool), TrieError> {
        if *deleted >= limit {
            return Ok((Some(NodeHandle::InMemory(node)), false, false));
        }

        match &*node {
            Node::Leaf(_) => {
                self.register_node_deleted(&node, pending)?;
                *deleted += 1;
                Ok((None, true, true))
            }
            Node::Branch(_) => {
                let mut owned = Self::unwrap_or_clone(node);
                self.prepare_for_mutation(&mut owned, pending)?;
                let branch = owned.as_branch_mut();

                if branch.value.is_some() {
                    branch.value = None;
                    *deleted += 1;
                }

                let mut all_deleted = true;
                for index in 0..crate::node::CHILDREN_CAPACITY {
                    let Some(child) = branch.children[index].clone() else {
                        continue;
                    };
                    if *deleted >= limit {
                        all_deleted = false;
                        break;
                    }
                    let child_node = self.resolve_handle(&child)?;
                    let (new_child, _, child_all) =
                        self.delete_values_limit(child_node, limit, deleted, pending)?;
                    branch.children[index] = new_child;
                    if !child_all {
                        all_deleted = false;
                    }
                }

                Self::recompute_descendants(branch);
                let merged = self.handle_deletion(owned, pending)?;
                Ok((merged.map(Self::wrap), true, all_deleted))
            }
        }
    }

    // --- ordered traversal ---

    /// Every `(key, value)` pair, in ascending key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Bytes)>, TrieError> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.entries_at(root, &mut Vec::new(), &mut out)?;
        }
        Ok(out)
    }

    fn entries_at(
        &self,
        handle: &NodeHandle,
        prefix: &mut Vec<u8>,
        out: &mut Vec<(Vec<u8>, Bytes)>,
    ) -> Result<(), TrieError> {
        let node = self.resolve_handle(handle)?;
        let before = prefix.len();
        prefix.extend_from_slice(node.partial_key());

        match &*node {
            Node::Leaf(leaf) => {
                let key = nibbles_to_key(prefix);
                let value = self.resolve_value(&leaf.value, &key)?;
                out.push((key, value));
            }
            Node::Branch(branch) => {
                if let Some(value) = &branch.value {
                    let key = nibbles_to_key(prefix);
                    let value = self.resolve_value(value, &key)?;
                    out.push((key, value));
                }
                for (index, child) in branch.children.iter().enumerate() {
                    if let Some(child) = child {
                        prefix.push(index as u8);
                        self.entries_at(child, prefix, out)?;
                        prefix.pop();
                    }
                }
            }
        }

        prefix.truncate(before);
        Ok(())
    }

    /// Every stored key starting with `prefix`, in ascending order.
    pub fn get_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, TrieError> {
        let nibbles = if prefix.is_empty() {
            Vec::new()
        } else {
            Self::prefix_to_nibbles(prefix)
        };
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.keys_with_prefix_at(root, &mut Vec::new(), &nibbles, &mut out)?;
        }
        Ok(out)
    }

    fn keys_with_prefix_at(
        &self,
        handle: &NodeHandle,
        prefix: &mut Vec<u8>,
        key: &[u8],
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), TrieError> {
        let node = self.resolve_handle(handle)?;
        let partial_key = node.partial_key();
        let common = crate::nibbles::common_prefix_len(partial_key, key);

        if common == key.len() {
            // Everything below this node matches the prefix.
            return self.collect_all_keys(handle, prefix, out);
        }
        if common < partial_key.len() {
            return Ok(());
        }

        let Node::Branch(branch) = &*node else {
            return Ok(());
        };
        let child_index = usize::from(key[partial_key.len()]);
        if let Some(child) = &branch.children[child_index] {
            let before = prefix.len();
            prefix.extend_from_slice(partial_key);
            prefix.push(child_index as u8);
            self.keys_with_prefix_at(child, prefix, &key[partial_key.len() + 1..], out)?;
            prefix.truncate(before);
        }
        Ok(())
    }

    fn collect_all_keys(
        &self,
        handle: &NodeHandle,
        prefix: &mut Vec<u8>,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), TrieError> {
        let node = self.resolve_handle(handle)?;
        let before = prefix.len();
        prefix.extend_from_slice(node.partial_key());

        match &*node {
            Node::Leaf(_) => out.push(nibbles_to_key(prefix)),
            Node::Branch(branch) => {
                if branch.value.is_some() {
                    out.push(nibbles_to_key(prefix));
                }
                for (index, child) in branch.children.iter().enumerate() {
                    if let Some(child) = child {
                        prefix.push(index as u8);
                        self.collect_all_keys(child, prefix, out)?;
                        prefix.pop();
                    }
                }
            }
        }

        prefix.truncate(before);
        Ok(())
    }

    // --- next key ---

    /// The smallest stored key strictly greater than `key`, or the smallest
    /// key overall when `key` is empty.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.next_key_filtered(key, &|_| true)
    }

    /// [`Self::next_key`] skipping candidates the filter rejects.
    pub fn next_key_filtered(
        &self,
        key: &[u8],
        filter: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, TrieError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let target = key_to_nibbles(key);
        self.next_key_at(root, &mut Vec::new(), &target, filter)
    }

    fn next_key_at(
        &self,
        handle: &NodeHandle,
        prefix: &mut Vec<u8>,
        target: &[u8],
        filter: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, TrieError> {
        let node = self.resolve_handle(handle)?;
        let mut full = prefix.clone();
        full.extend_from_slice(node.partial_key());

        // Compare the node's full key against the target's head of the same
        // length; a longer matching key compares greater.
        let head = &target[..target.len().min(full.len())];
        match full.as_slice().cmp(head) {
            std::cmp::Ordering::Greater => {
                // The whole subtree sorts after the target.
                return self.first_key_at(handle, prefix, filter);
            }
            std::cmp::Ordering::Less => return Ok(None),
            std::cmp::Ordering::Equal => {}
        }

        if full.len() == target.len() {
            // The node's key equals the target, which is not strictly
            // greater; the next key lives among the children.
            if let Node::Branch(branch) = &*node {
                for (index, child) in branch.children.iter().enumerate() {
                    if let Some(child) = child {
                        full.push(index as u8);
                        let found = self.first_key_at(child, &mut full, filter)?;
                        full.pop();
                        if found.is_some() {
                            return Ok(found);
                        }
                    }
                }
            }
            return Ok(None);
        }

        // The target descends below this node: follow its nibble first, then
        // try the higher siblings in order.
        let Node::Branch(branch) = &*node else {
            return Ok(None);
        };
        let next_index = usize::from(target[full.len()]);
        for (index, child) in branch.children.iter().enumerate().skip(next_index) {
            let Some(child) = child else { continue };
            full.push(index as u8);
            let found = if index == next_index {
                self.next_key_at(child, &mut full, target, filter)?
            } else {
                self.first_key_at(child, &mut full, filter)?
            };
            full.pop();
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// The smallest key in the subtree whose byte form passes the filter.
    fn first_key_at(
        &self,
        handle: &NodeHandle,
        prefix: &mut Vec<u8>,
        filter: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, TrieError> {
        let node = self.resolve_handle(handle)?;
        let before = prefix.len();
        prefix.extend_from_slice(node.partial_key());

        let result = (|| {
            match &*node {
                Node::Leaf(_) => {
                    let key = nibbles_to_key(prefix);
                    if filter(&key) {
                        return Ok(Some(key));
                    }
                    Ok(None)
                }
                Node::Branch(branch) => {
                    if branch.value.is_some() {
                        let key = nibbles_to_key(prefix);
                        if filter(&key) {
                            return Ok(Some(key));
                        }
                    }
                    for (index, child) in branch.children.iter().enumerate() {
                        if let Some(child) = child {
                            prefix.push(index as u8);
                            let found = self.first_key_at(child, prefix, filter)?;
                            prefix.pop();
                            if found.is_some() {
                                return Ok(found);
                            }
                        }
                    }
                    Ok(None)
                }
            }
        })();

        prefix.truncate(before);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_nibbles_trims_one_trailing_zero() {
        assert_eq!(Trie::prefix_to_nibbles(&[0xf0]), vec![0xf]);
        assert_eq!(Trie::prefix_to_nibbles(&[0xf2]), vec![0xf, 0x2]);
        // Only one trailing zero nibble is trimmed.
        assert_eq!(Trie::prefix_to_nibbles(&[0x01, 0x00]), vec![0, 1, 0]);
        assert_eq!(Trie::prefix_to_nibbles(&[0x00]), vec![0]);
    }

    #[test]
    fn test_deltas_not_tracked_before_first_snapshot() {
        let mut trie = Trie::new(TrieVersion::V0);
        let mut pending = Deltas::new();
        pending.record_deleted(Hash256::from_slice(&[1; 32]).unwrap());
        trie.handle_tracked_deltas(true, pending);
        assert!(trie.deltas().is_empty());
    }

    #[test]
    fn test_deltas_dropped_on_failure() {
        let mut trie = Trie::new(TrieVersion::V0);
        trie.generation = 1;
        let mut pending = Deltas::new();
        pending.record_deleted(Hash256::from_slice(&[1; 32]).unwrap());
        trie.handle_tracked_deltas(false, pending);
        assert!(trie.deltas().is_empty());

        let mut pending = Deltas::new();
        pending.record_deleted(Hash256::from_slice(&[1; 32]).unwrap());
        trie.handle_tracked_deltas(true, pending);
        assert_eq!(trie.deltas().deleted().count(), 1);
    }

    #[test]
    fn test_snapshot_shares_nodes_by_reference() {
        let mut trie = Trie::new(TrieVersion::V0);
        trie.put(b"shared", b"value").unwrap();

        let snapshot = trie.snapshot();
        let (Some(NodeHandle::InMemory(a)), Some(NodeHandle::InMemory(b))) =
            (&trie.root, &snapshot.root)
        else {
            panic!("both handles hold in-memory roots");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_mutation_unshares_nodes() {
        let mut trie = Trie::new(TrieVersion::V0);
        trie.put(b"shared", b"value").unwrap();
        let snapshot = trie.snapshot();

        trie.put(b"shared", b"changed").unwrap();
        let (Some(NodeHandle::InMemory(a)), Some(NodeHandle::InMemory(b))) =
            (&trie.root, &snapshot.root)
        else {
            panic!("both handles hold in-memory roots");
        };
        assert!(!Arc::ptr_eq(a, b));
        assert_eq!(b.generation(), 0);
        assert_eq!(a.generation(), trie.generation);
    }

    #[test]
    fn test_register_node_deleted_skips_dirty_and_inline() {
        let trie = Trie::new(TrieVersion::V0);
        let mut pending = Deltas::new();

        // Dirty nodes were never persisted.
        let dirty = Node::new_leaf(vec![1], NodeValue::Inline(Bytes::from_static(b"v")), 0);
        trie.register_node_deleted(&dirty, &mut pending).unwrap();
        assert!(pending.is_empty());

        // Clean nodes with a small encoding live inside their parent.
        let mut small = Node::new_leaf(vec![1], NodeValue::Inline(Bytes::from_static(b"v")), 0);
        small.set_dirty(false);
        trie.register_node_deleted(&small, &mut pending).unwrap();
        assert!(pending.is_empty());

        // Clean nodes with a digest-sized Merkle value are recorded.
        let mut large = Node::new_leaf(vec![1], NodeValue::Inline(Bytes::from(vec![7u8; 40])), 0);
        large.set_dirty(false);
        trie.register_node_deleted(&large, &mut pending).unwrap();
        assert_eq!(pending.deleted().count(), 1);
    }

    #[test]
    fn test_generation_bumps_per_snapshot() {
        let trie = Trie::new(TrieVersion::V0);
        assert_eq!(trie.generation(), 0);
        let snap = trie.snapshot();
        assert_eq!(snap.generation(), 1);
        assert_eq!(snap.snapshot().generation(), 2);
        assert_eq!(trie.generation(), 0);
    }
}
