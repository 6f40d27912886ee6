//! Two-level lookup cache for database-backed tries.
//!
//! Level one caches decoded nodes keyed by digest; level two caches raw
//! values keyed by the full byte key. Both levels are bounded with
//! least-recently-used eviction and are internally synchronized, so one cache
//! may serve concurrent lookups against a shared trie handle.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use filament_primitives::Hash256;
use hashbrown::HashMap;
use std::collections::VecDeque;

use crate::node::Node;

/// Hit/miss/eviction counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that fell through to the store.
    pub misses: u64,
    /// Entries evicted to respect the capacity bound.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered from the cache.
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[derive(Debug)]
struct Level<K: std::hash::Hash + Eq + Clone, V> {
    entries: HashMap<K, V>,
    lru: VecDeque<K>,
}

impl<K: std::hash::Hash + Eq + Clone, V> Default for Level<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> Level<K, V> {
    fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key)?.clone();
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
        Some(value)
    }

    fn put(&mut self, key: K, value: V, capacity: usize) -> u64 {
        if self.entries.insert(key.clone(), value).is_none() {
            self.lru.push_back(key);
        }
        let mut evictions = 0;
        while self.entries.len() > capacity {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evictions += 1;
        }
        evictions
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }
}

/// A bounded, internally synchronized node/value cache.
#[derive(Debug)]
pub struct TrieCache {
    nodes: RwLock<Level<Hash256, Arc<Node>>>,
    values: RwLock<Level<Vec<u8>, Bytes>>,
    stats: RwLock<CacheStats>,
    node_capacity: usize,
    value_capacity: usize,
}

impl TrieCache {
    /// Default bound on each cache level.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// A cache with the default capacity per level.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY, Self::DEFAULT_CAPACITY)
    }

    /// A cache bounded to the given number of nodes and values.
    pub fn with_capacity(node_capacity: usize, value_capacity: usize) -> Self {
        Self {
            nodes: RwLock::new(Level::default()),
            values: RwLock::new(Level::default()),
            stats: RwLock::new(CacheStats::default()),
            node_capacity: node_capacity.max(1),
            value_capacity: value_capacity.max(1),
        }
    }

    /// The decoded node stored under `hash`, if cached.
    pub fn get_node(&self, hash: &Hash256) -> Option<Arc<Node>> {
        let node = self.nodes.write().expect("lock poisoned").get(hash);
        self.count(node.is_some());
        node
    }

    /// Caches a decoded node under its digest.
    pub fn put_node(&self, hash: Hash256, node: Arc<Node>) {
        let evictions = self
            .nodes
            .write()
            .expect("lock poisoned")
            .put(hash, node, self.node_capacity);
        self.stats.write().expect("lock poisoned").evictions += evictions;
    }

    /// The raw value stored under the full byte key, if cached.
    pub fn get_value(&self, key: &[u8]) -> Option<Bytes> {
        let value = self
            .values
            .write()
            .expect("lock poisoned")
            .get(&key.to_vec());
        self.count(value.is_some());
        value
    }

    /// Caches a raw value under its full byte key.
    pub fn put_value(&self, key: &[u8], value: Bytes) {
        let evictions = self.values.write().expect("lock poisoned").put(
            key.to_vec(),
            value,
            self.value_capacity,
        );
        self.stats.write().expect("lock poisoned").evictions += evictions;
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        *self.stats.read().expect("lock poisoned")
    }

    /// Drops every cached entry and resets the counters.
    pub fn clear(&self) {
        self.nodes.write().expect("lock poisoned").clear();
        self.values.write().expect("lock poisoned").clear();
        *self.stats.write().expect("lock poisoned") = CacheStats::default();
    }

    fn count(&self, hit: bool) {
        let mut stats = self.stats.write().expect("lock poisoned");
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }
}

impl Default for TrieCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeValue;

    fn hash(n: u8) -> Hash256 {
        Hash256::from_slice(&[n; 32]).unwrap()
    }

    fn leaf(n: u8) -> Arc<Node> {
        Arc::new(Node::new_leaf(
            vec![n],
            NodeValue::Inline(Bytes::copy_from_slice(&[n])),
            0,
        ))
    }

    #[test]
    fn test_node_cache_hit_and_miss() {
        let cache = TrieCache::new();
        assert!(cache.get_node(&hash(1)).is_none());

        cache.put_node(hash(1), leaf(1));
        assert!(cache.get_node(&hash(1)).is_some());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_value_cache() {
        let cache = TrieCache::new();
        cache.put_value(b"key", Bytes::from_static(b"value"));
        assert_eq!(cache.get_value(b"key"), Some(Bytes::from_static(b"value")));
        assert_eq!(cache.get_value(b"other"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TrieCache::with_capacity(2, 2);
        cache.put_node(hash(1), leaf(1));
        cache.put_node(hash(2), leaf(2));

        // Touch 1 so 2 becomes the eviction candidate.
        assert!(cache.get_node(&hash(1)).is_some());
        cache.put_node(hash(3), leaf(3));

        assert!(cache.get_node(&hash(2)).is_none());
        assert!(cache.get_node(&hash(1)).is_some());
        assert!(cache.get_node(&hash(3)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let cache = TrieCache::new();
        cache.put_node(hash(1), leaf(1));
        cache.put_value(b"k", Bytes::from_static(b"v"));
        cache.clear();
        assert!(cache.get_node(&hash(1)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }
}
