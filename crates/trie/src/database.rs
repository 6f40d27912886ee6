//! The backing-store contract and reference implementations.
//!
//! The trie consumes a byte-keyed get/put/delete service with batched writes
//! and a prefix-respecting ordered iterator. Durability, compaction and
//! retries are the store's business, not the trie's; store failures are
//! returned to the caller wrapped with operation context, never retried here.

use std::sync::RwLock;

use thiserror::Error;

/// An opaque backing-store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DatabaseError(pub String);

/// Read access to the store.
pub trait DbGetter {
    /// Fetches the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;
}

/// Write access to the store.
pub trait DbPutter {
    /// Stores `value` under `key`, replacing any previous value.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Removes `key` if present.
    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError>;
}

/// A staged set of writes applied atomically.
///
/// Nothing is visible to readers until [`Batch::flush`]; [`Batch::cancel`]
/// drops everything staged.
pub trait Batch {
    /// Stages a put.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Stages a delete.
    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError>;

    /// Applies all staged writes as one unit.
    fn flush(&mut self) -> Result<(), DatabaseError>;

    /// Drops all staged writes.
    fn cancel(&mut self);
}

/// An ordered iterator over the store.
///
/// Keys are visited in ascending byte order; `release` ends the iteration
/// and frees any underlying resources.
pub trait DbIterator {
    /// Positions at the first key `>= key`. Returns whether one exists.
    fn seek_ge(&mut self, key: &[u8]) -> bool;

    /// Advances to the next key. Returns whether one exists.
    fn next(&mut self) -> bool;

    /// The current key.
    fn key(&self) -> &[u8];

    /// The current value.
    fn value(&self) -> &[u8];

    /// Ends the iteration.
    fn release(&mut self);
}

/// The full store contract the trie's persistence layer consumes.
pub trait Database: DbGetter {
    /// Creates a batch for atomic multi-key writes.
    fn new_batch(&self) -> Box<dyn Batch + '_>;

    /// Creates an ordered iterator over the whole store.
    fn new_iterator(&self) -> Box<dyn DbIterator + '_>;
}

/// An in-memory store, used in tests and as the reference implementation of
/// the contract. Internally synchronized; safe to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    inner: RwLock<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock poisoned").len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DbGetter for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.inner.read().expect("lock poisoned").get(key).cloned())
    }
}

impl DbPutter for MemoryDatabase {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .expect("lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        self.inner.write().expect("lock poisoned").remove(key);
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn new_batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemoryBatch {
            db: self,
            writes: Vec::new(),
        })
    }

    fn new_iterator(&self) -> Box<dyn DbIterator + '_> {
        let entries = self
            .inner
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemoryIterator { entries, pos: None })
    }
}

enum StagedWrite {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Batch over a [`MemoryDatabase`]: staged writes applied under one lock.
pub struct MemoryBatch<'a> {
    db: &'a MemoryDatabase,
    writes: Vec<StagedWrite>,
}

impl Batch for MemoryBatch<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.writes
            .push(StagedWrite::Put(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        self.writes.push(StagedWrite::Delete(key.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DatabaseError> {
        let mut inner = self.db.inner.write().expect("lock poisoned");
        for write in self.writes.drain(..) {
            match write {
                StagedWrite::Put(key, value) => {
                    inner.insert(key, value);
                }
                StagedWrite::Delete(key) => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn cancel(&mut self) {
        self.writes.clear();
    }
}

/// Iterator over a point-in-time snapshot of a [`MemoryDatabase`].
pub struct MemoryIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl DbIterator for MemoryIterator {
    fn seek_ge(&mut self, key: &[u8]) -> bool {
        let pos = self.entries.partition_point(|(k, _)| k.as_slice() < key);
        if pos < self.entries.len() {
            self.pos = Some(pos);
            true
        } else {
            self.pos = None;
            false
        }
    }

    fn next(&mut self) -> bool {
        let next = match self.pos {
            Some(pos) => pos + 1,
            None => 0,
        };
        if next < self.entries.len() {
            self.pos = Some(next);
            true
        } else {
            self.pos = None;
            false
        }
    }

    fn key(&self) -> &[u8] {
        let pos = self.pos.expect("iterator not positioned");
        &self.entries[pos].0
    }

    fn value(&self) -> &[u8] {
        let pos = self.pos.expect("iterator not positioned");
        &self.entries[pos].1
    }

    fn release(&mut self) {
        self.entries.clear();
        self.pos = None;
    }
}

/// A keyspace partition of another store: every key is prefixed with a fixed
/// byte string, letting multiple data sets share one database.
#[derive(Debug)]
pub struct Table<D> {
    db: D,
    prefix: Vec<u8>,
}

impl<D> Table<D> {
    /// Wraps `db`, prefixing every key with `prefix`.
    pub fn new(db: D, prefix: &[u8]) -> Self {
        Self {
            db,
            prefix: prefix.to_vec(),
        }
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }
}

impl<D: DbGetter> DbGetter for Table<D> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.db.get(&self.prefixed(key))
    }
}

impl<D: DbPutter> DbPutter for Table<D> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.db.put(&self.prefixed(key), value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        self.db.delete(&self.prefixed(key))
    }
}

impl<T: DbGetter + ?Sized> DbGetter for &T {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        (**self).get(key)
    }
}

impl<T: DbGetter + ?Sized> DbGetter for &mut T {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        (**self).get(key)
    }
}

impl<T: DbPutter + ?Sized> DbPutter for &mut T {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        (**self).put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        (**self).delete(key)
    }
}

impl<T: DbGetter + ?Sized> DbGetter for std::sync::Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        (**self).get(key)
    }
}

// --- trie persistence ---

use std::sync::Arc;

use filament_primitives::Hash256;
use hashbrown::HashSet;

use crate::error::TrieError;
use crate::layout::{empty_trie_hash, TrieVersion};
use crate::node::decode::decode_node_bytes;
use crate::node::encode::{encode_node, hashed_value_preimage};
use crate::node::merkle::{merkle_value, merkle_value_root};
use crate::node::{Node, NodeHandle};
use crate::trie::Trie;

impl Trie {
    /// Rehydrates a trie from the store, fetching only the root node;
    /// children stay digest references resolved on demand.
    pub fn load(
        db: Arc<dyn DbGetter + Send + Sync>,
        root_hash: Hash256,
        version: TrieVersion,
    ) -> Result<Trie, TrieError> {
        let mut trie = Trie::new(version).with_db(db.clone());
        if root_hash == empty_trie_hash() {
            return Ok(trie);
        }

        let encoding = db
            .get(root_hash.as_bytes())
            .map_err(|err| TrieError::Database(format!("getting root {root_hash}: {err}")))?
            .ok_or(TrieError::IncompleteDatabase(root_hash))?;
        let mut root = decode_node_bytes(&encoding)
            .map_err(TrieError::Codec)?
            .ok_or_else(|| {
                TrieError::Database(format!("root {root_hash} stored as the empty node"))
            })?;
        root.set_merkle_value(merkle_value(version, &encoding));

        log::debug!("loaded trie root {root_hash} ({} bytes)", encoding.len());
        trie.root = Some(NodeHandle::InMemory(Arc::new(root)));
        Ok(trie)
    }

    /// Encodes every dirty node bottom-up and stages `digest -> encoding`
    /// writes (plus `value digest -> value` for out-of-line values) into one
    /// batch, flushed atomically; then clears dirtiness.
    pub fn write_dirty(&mut self, db: &dyn Database) -> Result<(), TrieError> {
        let Some(NodeHandle::InMemory(root)) = &mut self.root else {
            return Ok(());
        };
        if !root.is_dirty() {
            return Ok(());
        }

        let mut batch = db.new_batch();
        let version = self.version;
        let result = Self::write_dirty_at(Arc::make_mut(root), version, true, batch.as_mut());
        match result {
            Ok(()) => {
                batch
                    .flush()
                    .map_err(|err| TrieError::Database(format!("flushing dirty nodes: {err}")))?;
                self.deltas.clear();
                Ok(())
            }
            Err(err) => {
                batch.cancel();
                Err(err)
            }
        }
    }

    fn write_dirty_at(
        node: &mut Node,
        version: TrieVersion,
        is_root: bool,
        batch: &mut dyn Batch,
    ) -> Result<(), TrieError> {
        if !node.is_dirty() {
            return Ok(());
        }

        // Children first, so every child cache is filled before encoding.
        if let Node::Branch(branch) = node {
            for child in branch.children.iter_mut() {
                if let Some(NodeHandle::InMemory(child_node)) = child {
                    Self::write_dirty_at(Arc::make_mut(child_node), version, false, batch)?;
                }
            }
        }

        let encoding = encode_node(node, version)?;
        let node_merkle = merkle_value(version, &encoding);
        node.set_merkle_value(node_merkle.clone());

        let stored_under = if is_root {
            // The root is always stored by digest, whatever its size.
            Some(merkle_value_root(version, &encoding))
        } else if node_merkle.len() == Hash256::LENGTH {
            Some(Hash256::from_slice(&node_merkle).expect("length checked"))
        } else {
            // Inline nodes live inside their parent's encoding.
            None
        };
        if let Some(hash) = stored_under {
            batch
                .put(hash.as_bytes(), &encoding)
                .map_err(|err| TrieError::Database(format!("putting node {hash}: {err}")))?;
        }

        if let Some((value_hash, value)) = hashed_value_preimage(node, version) {
            batch
                .put(value_hash.as_bytes(), &value)
                .map_err(|err| TrieError::Database(format!("putting value {value_hash}: {err}")))?;
        }

        node.set_dirty(false);
        Ok(())
    }

    /// The digests this trie would newly persist and those it has made
    /// unreachable since the last flush, for incremental persistence and
    /// pruning.
    pub fn get_changed_node_hashes(
        &mut self,
    ) -> Result<(HashSet<Hash256>, HashSet<Hash256>), TrieError> {
        let mut inserted = HashSet::new();
        let version = self.version;
        if let Some(NodeHandle::InMemory(root)) = &mut self.root {
            if root.is_dirty() {
                Self::collect_inserted(Arc::make_mut(root), version, true, &mut inserted)?;
            }
        }
        let deleted = self.deltas.deleted().copied().collect();
        Ok((inserted, deleted))
    }

    fn collect_inserted(
        node: &mut Node,
        version: TrieVersion,
        is_root: bool,
        inserted: &mut HashSet<Hash256>,
    ) -> Result<(), TrieError> {
        if !node.is_dirty() {
            return Ok(());
        }
        if let Node::Branch(branch) = node {
            for child in branch.children.iter_mut() {
                if let Some(NodeHandle::InMemory(child_node)) = child {
                    Self::collect_inserted(Arc::make_mut(child_node), version, false, inserted)?;
                }
            }
        }
        let encoding = encode_node(node, version)?;
        let node_merkle = merkle_value(version, &encoding);
        if is_root {
            inserted.insert(merkle_value_root(version, &encoding));
        } else if node_merkle.len() == Hash256::LENGTH {
            inserted.insert(Hash256::from_slice(&node_merkle).expect("length checked"));
        }
        node.set_merkle_value(node_merkle);
        Ok(())
    }
}

/// One-shot lookup walking the store directly, without building a trie
/// handle.
pub fn get_from_db(
    db: &dyn DbGetter,
    root_hash: Hash256,
    key: &[u8],
    version: TrieVersion,
) -> Result<Option<Vec<u8>>, TrieError> {
    if root_hash == empty_trie_hash() {
        return Ok(None);
    }
    let root = fetch_and_decode(db, root_hash)?;
    get_from_db_at(db, &root, crate::nibbles::NibblePath::new(key))
}

fn fetch_and_decode(db: &dyn DbGetter, hash: Hash256) -> Result<Node, TrieError> {
    let encoding = db
        .get(hash.as_bytes())
        .map_err(|err| TrieError::Database(format!("getting node {hash}: {err}")))?
        .ok_or(TrieError::IncompleteDatabase(hash))?;
    decode_node_bytes(&encoding)
        .map_err(TrieError::Codec)?
        .ok_or_else(|| TrieError::Database(format!("node {hash} stored as the empty node")))
}

fn get_from_db_at(
    db: &dyn DbGetter,
    node: &Node,
    path: crate::nibbles::NibblePath<'_>,
) -> Result<Option<Vec<u8>>, TrieError> {
    let partial_key = node.partial_key();
    let value = if path.len() == partial_key.len() && path.starts_with(partial_key) {
        node.value()
    } else {
        let common = path.common_prefix_len(partial_key);
        if common < partial_key.len() {
            return Ok(None);
        }
        let Node::Branch(branch) = node else {
            return Ok(None);
        };
        let index = usize::from(path.at(partial_key.len()));
        return match &branch.children[index] {
            None => Ok(None),
            Some(NodeHandle::InMemory(child)) => {
                get_from_db_at(db, child, path.mid(partial_key.len() + 1))
            }
            Some(NodeHandle::Hashed(hash)) => {
                let child = fetch_and_decode(db, *hash)?;
                get_from_db_at(db, &child, path.mid(partial_key.len() + 1))
            }
        };
    };

    match value {
        None => Ok(None),
        Some(crate::node::NodeValue::Inline(bytes)) => Ok(Some(bytes.to_vec())),
        Some(crate::node::NodeValue::Hashed(hash)) => db
            .get(hash.as_bytes())
            .map_err(|err| TrieError::Database(format!("getting value {hash}: {err}")))?
            .ok_or(TrieError::IncompleteDatabase(*hash))
            .map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database_put_get_delete() {
        let mut db = MemoryDatabase::new();
        assert_eq!(db.get(b"a").unwrap(), None);

        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));

        db.delete(b"a").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_batch_is_atomic_until_flush() {
        let db = MemoryDatabase::new();
        let mut batch = db.new_batch();
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);

        batch.flush().unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_batch_cancel_discards_writes() {
        let db = MemoryDatabase::new();
        let mut batch = db.new_batch();
        batch.put(b"a", b"1").unwrap();
        batch.cancel();
        batch.flush().unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_iterator_seek_ge_and_next() {
        let mut db = MemoryDatabase::new();
        for key in [b"aa".as_slice(), b"ab", b"b", b"ca"] {
            db.put(key, key).unwrap();
        }

        let mut iter = db.new_iterator();
        assert!(iter.seek_ge(b"ab"));
        assert_eq!(iter.key(), b"ab");
        assert!(iter.next());
        assert_eq!(iter.key(), b"b");
        assert!(iter.next());
        assert_eq!(iter.key(), b"ca");
        assert!(!iter.next());

        let mut iter = db.new_iterator();
        assert!(!iter.seek_ge(b"zz"));
        iter.release();
    }

    #[test]
    fn test_table_partitions_keyspace() {
        let mut db = MemoryDatabase::new();
        db.put(b"raw", b"0").unwrap();

        let mut table = Table::new(&mut db, b"t1:");
        table.put(b"k", b"1").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"raw").unwrap(), None);

        assert_eq!(db.get(b"t1:k").unwrap(), Some(b"1".to_vec()));
    }
}
