//! Child tries.
//!
//! A child trie is a fully independent trie whose root digest is stored as an
//! ordinary value in its parent, under a reserved key prefix plus the child's
//! identifying key. Child handles live in a map on the parent and are shared
//! by snapshots; a child loaded from the store materializes lazily from its
//! digest.

use filament_primitives::Hash256;

use crate::error::TrieError;
use crate::node::NodeHandle;
use crate::trie::Trie;

/// Reserved key prefix under which child-trie root digests are stored.
pub const CHILD_STORAGE_PREFIX: &[u8] = b":child_storage:";

fn child_storage_key(key_to_child: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHILD_STORAGE_PREFIX.len() + key_to_child.len());
    key.extend_from_slice(CHILD_STORAGE_PREFIX);
    key.extend_from_slice(key_to_child);
    key
}

impl Trie {
    /// The root digest the parent currently stores for a child, if any.
    fn child_root_hash(&self, key_to_child: &[u8]) -> Result<Option<Hash256>, TrieError> {
        let Some(stored) = self.get(&child_storage_key(key_to_child))? else {
            return Ok(None);
        };
        let hash = Hash256::from_slice(&stored).map_err(|_| TrieError::InvalidHashLength {
            expected: Hash256::LENGTH,
            got: stored.len(),
        })?;
        Ok(Some(hash))
    }

    /// Stores `child` under the reserved prefix plus `key_to_child`,
    /// replacing any previous child at that key.
    pub fn set_child(&mut self, key_to_child: &[u8], mut child: Trie) -> Result<(), TrieError> {
        let child_hash = child.root_hash()?;
        if let Some(old_hash) = self.child_root_hash(key_to_child)? {
            if old_hash != child_hash {
                self.child_tries.remove(&old_hash);
            }
        }
        self.put(&child_storage_key(key_to_child), child_hash.as_bytes())?;
        self.child_tries.insert(child_hash, child);
        Ok(())
    }

    /// The child trie stored at `key_to_child`.
    ///
    /// A child known only by digest (e.g. after [`Trie::load`]) is
    /// materialized lazily against the parent's backing store.
    pub fn get_child(&mut self, key_to_child: &[u8]) -> Result<&Trie, TrieError> {
        let hash = self
            .child_root_hash(key_to_child)?
            .ok_or_else(|| TrieError::ChildTrieDoesNotExist {
                key: key_to_child.to_vec(),
            })?;
        if !self.child_tries.contains_key(&hash) {
            let mut lazy = Trie::new(self.version);
            lazy.db = self.db.clone();
            lazy.root = Some(NodeHandle::Hashed(hash));
            self.child_tries.insert(hash, lazy);
        }
        Ok(self
            .child_tries
            .get(&hash)
            .expect("inserted or present above"))
    }

    /// Inserts into the child trie at `key_to_child`, creating the child if
    /// it does not exist, and re-anchors its new root in the parent.
    pub fn put_into_child(
        &mut self,
        key_to_child: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<(), TrieError> {
        let mut child = self.take_child_or_new(key_to_child)?;
        child.put(key, value)?;
        self.set_child(key_to_child, child)
    }

    /// The value under `key` in the child trie at `key_to_child`.
    pub fn get_from_child(
        &mut self,
        key_to_child: &[u8],
        key: &[u8],
    ) -> Result<Option<bytes::Bytes>, TrieError> {
        self.get_child(key_to_child)?.get(key)
    }

    /// Deletes `key` from the child trie at `key_to_child` and re-anchors
    /// its new root in the parent.
    pub fn clear_from_child(&mut self, key_to_child: &[u8], key: &[u8]) -> Result<(), TrieError> {
        let mut child = self.take_child(key_to_child)?;
        child.delete(key)?;
        self.set_child(key_to_child, child)
    }

    /// Removes the child trie at `key_to_child` and its anchor in the
    /// parent. Removing an absent child is a no-op.
    pub fn delete_child(&mut self, key_to_child: &[u8]) -> Result<(), TrieError> {
        if let Some(hash) = self.child_root_hash(key_to_child)? {
            self.child_tries.remove(&hash);
            self.delete(&child_storage_key(key_to_child))?;
        }
        Ok(())
    }

    fn take_child(&mut self, key_to_child: &[u8]) -> Result<Trie, TrieError> {
        self.get_child(key_to_child)?;
        let hash = self
            .child_root_hash(key_to_child)?
            .expect("get_child verified existence");
        Ok(self
            .child_tries
            .remove(&hash)
            .expect("get_child materialized the handle"))
    }

    fn take_child_or_new(&mut self, key_to_child: &[u8]) -> Result<Trie, TrieError> {
        match self.take_child(key_to_child) {
            Ok(child) => Ok(child),
            Err(TrieError::ChildTrieDoesNotExist { .. }) => {
                let mut child = Trie::new(self.version);
                child.db = self.db.clone();
                Ok(child)
            }
            Err(err) => Err(err),
        }
    }
}
