//! Tests of the database-backed paths: flushing dirty nodes, lazy loading,
//! one-shot lookups, change tracking, caching and access recording.

use std::sync::{Arc, Mutex};

use filament_trie::{
    empty_trie_hash, get_from_db, DbGetter, MemoryDatabase, Recorder, Trie, TrieCache, TrieError,
    TrieVersion,
};

// Values are padded past the digest size so interior nodes reference their
// children by hash and the lazy paths actually hit the store.
fn big(value: &[u8]) -> Vec<u8> {
    let mut out = value.to_vec();
    out.resize(40, 0x5a);
    out
}

fn build_and_flush(db: &MemoryDatabase) -> (Trie, filament_trie::Hash256) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut trie = Trie::new(TrieVersion::V0);
    trie.put(b"alpha", &big(b"a")).unwrap();
    trie.put(b"alphabet", &big(b"ab")).unwrap();
    trie.put(b"beta", &big(b"b")).unwrap();
    trie.put(b"bet", &big(b"bb")).unwrap();
    trie.write_dirty(db).unwrap();
    let root = trie.root_hash().unwrap();
    (trie, root)
}

#[test]
fn test_write_dirty_and_load_round_trip() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);
    assert!(!db.is_empty());

    let loaded = Trie::load(db.clone(), root, TrieVersion::V0).unwrap();
    assert_eq!(loaded.get(b"alpha").unwrap().as_deref(), Some(&big(b"a")[..]));
    assert_eq!(loaded.get(b"alphabet").unwrap().as_deref(), Some(&big(b"ab")[..]));
    assert_eq!(loaded.get(b"beta").unwrap().as_deref(), Some(&big(b"b")[..]));
    assert_eq!(loaded.get(b"bet").unwrap().as_deref(), Some(&big(b"bb")[..]));
    assert_eq!(loaded.get(b"missing").unwrap(), None);
}

#[test]
fn test_loaded_trie_rehashes_to_same_root() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    let mut loaded = Trie::load(db, root, TrieVersion::V0).unwrap();
    assert_eq!(loaded.root_hash().unwrap(), root);
}

#[test]
fn test_load_empty_root() {
    let db = Arc::new(MemoryDatabase::new());
    let trie = Trie::load(db, empty_trie_hash(), TrieVersion::V0).unwrap();
    assert!(trie.is_empty());
}

#[test]
fn test_load_missing_root_errors() {
    let db = Arc::new(MemoryDatabase::new());
    let missing = filament_trie::Hash256::from_slice(&[7u8; 32]).unwrap();
    let err = Trie::load(db, missing, TrieVersion::V0).unwrap_err();
    assert_eq!(err, TrieError::IncompleteDatabase(missing));
}

#[test]
fn test_write_dirty_skips_clean_trie() {
    let db = Arc::new(MemoryDatabase::new());
    let (mut trie, _) = build_and_flush(&db);
    let stored = db.len();

    // Nothing dirty: a second flush writes nothing new.
    trie.write_dirty(db.as_ref()).unwrap();
    assert_eq!(db.len(), stored);

    // A byte-identical re-insertion leaves the trie clean.
    trie.put(b"alpha", &big(b"a")).unwrap();
    trie.write_dirty(db.as_ref()).unwrap();
    assert_eq!(db.len(), stored);
}

#[test]
fn test_idempotent_put_reports_no_changed_nodes() {
    let db = Arc::new(MemoryDatabase::new());
    let (mut trie, _) = build_and_flush(&db);

    trie.put(b"alpha", &big(b"a")).unwrap();
    let (inserted, deleted) = trie.get_changed_node_hashes().unwrap();
    assert!(inserted.is_empty());
    assert!(deleted.is_empty());
}

#[test]
fn test_get_from_db_one_shot() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    let got = get_from_db(db.as_ref(), root, b"beta", TrieVersion::V0).unwrap();
    assert_eq!(got.as_deref(), Some(&big(b"b")[..]));
    assert_eq!(
        get_from_db(db.as_ref(), root, b"nope", TrieVersion::V0).unwrap(),
        None
    );
    assert_eq!(
        get_from_db(db.as_ref(), empty_trie_hash(), b"beta", TrieVersion::V0).unwrap(),
        None
    );
}

#[test]
fn test_lazy_trie_supports_mutation() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    let mut loaded = Trie::load(db.clone(), root, TrieVersion::V0).unwrap();
    loaded.put(b"gamma", &big(b"g")).unwrap();
    loaded.delete(b"beta").unwrap();

    assert_eq!(loaded.get(b"gamma").unwrap().as_deref(), Some(&big(b"g")[..]));
    assert_eq!(loaded.get(b"beta").unwrap(), None);
    assert_eq!(loaded.get(b"alpha").unwrap().as_deref(), Some(&big(b"a")[..]));

    // The lazily mutated trie hashes like one built in memory from scratch.
    let mut direct = Trie::new(TrieVersion::V0);
    direct.put(b"alpha", &big(b"a")).unwrap();
    direct.put(b"alphabet", &big(b"ab")).unwrap();
    direct.put(b"bet", &big(b"bb")).unwrap();
    direct.put(b"gamma", &big(b"g")).unwrap();
    assert_eq!(loaded.root_hash().unwrap(), direct.root_hash().unwrap());
}

#[test]
fn test_changed_node_hashes_after_snapshot() {
    let db = Arc::new(MemoryDatabase::new());
    let (trie, _) = build_and_flush(&db);

    let mut snapshot = trie.snapshot();
    snapshot.put(b"alpha", &big(b"changed")).unwrap();

    let (inserted, deleted) = snapshot.get_changed_node_hashes().unwrap();
    assert!(!inserted.is_empty());
    assert!(!deleted.is_empty());

    // Every deleted digest was actually persisted before the change.
    for hash in &deleted {
        assert!(
            db.get(hash.as_bytes()).unwrap().is_some(),
            "deleted digest {hash} was never stored"
        );
    }

    // Flushing the snapshot stores every newly inserted digest.
    snapshot.write_dirty(db.as_ref()).unwrap();
    for hash in &inserted {
        assert!(db.get(hash.as_bytes()).unwrap().is_some());
    }
}

#[test]
fn test_pruning_deleted_nodes_keeps_new_root_loadable() {
    let db = Arc::new(MemoryDatabase::new());
    let (trie, _) = build_and_flush(&db);

    let mut snapshot = trie.snapshot();
    snapshot.put(b"alpha", &big(b"changed")).unwrap();
    let (_, deleted) = snapshot.get_changed_node_hashes().unwrap();
    snapshot.write_dirty(db.as_ref()).unwrap();
    let new_root = snapshot.root_hash().unwrap();

    // Prune everything the mutation made unreachable.
    use filament_trie::Database;
    let mut batch = db.new_batch();
    for hash in &deleted {
        batch.delete(hash.as_bytes()).unwrap();
    }
    batch.flush().unwrap();

    let pruned = Trie::load(db.clone(), new_root, TrieVersion::V0).unwrap();
    assert_eq!(
        pruned.get(b"alpha").unwrap().as_deref(),
        Some(&big(b"changed")[..])
    );
    assert_eq!(pruned.get(b"beta").unwrap().as_deref(), Some(&big(b"b")[..]));
}

#[test]
fn test_missing_interior_node_is_incomplete_database() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    // Drop every stored entry except the root node itself.
    use filament_trie::Database;
    let keys: Vec<Vec<u8>> = {
        let mut iter = db.new_iterator();
        let mut keys = Vec::new();
        let mut more = iter.seek_ge(&[]);
        while more {
            if iter.key() != root.as_bytes() {
                keys.push(iter.key().to_vec());
            }
            more = iter.next();
        }
        keys
    };
    let mut batch = db.new_batch();
    for key in &keys {
        batch.delete(key).unwrap();
    }
    batch.flush().unwrap();
    drop(batch);

    let loaded = Trie::load(db, root, TrieVersion::V0).unwrap();
    let err = loaded.get(b"alpha").unwrap_err();
    assert!(matches!(err, TrieError::IncompleteDatabase(_)));
}

#[test]
fn test_v1_hashed_values_persist_out_of_line() {
    let db = Arc::new(MemoryDatabase::new());
    let large = vec![0x17u8; 100];

    let mut trie = Trie::new(TrieVersion::V1);
    trie.put(b"large", &large).unwrap();
    trie.put(b"small", b"s").unwrap();
    trie.write_dirty(db.as_ref()).unwrap();
    let root = trie.root_hash().unwrap();

    // The value preimage sits in the store under its own digest.
    let value_hash = TrieVersion::V1.hash(&large);
    assert_eq!(db.get(value_hash.as_bytes()).unwrap(), Some(large.clone()));

    let loaded = Trie::load(db, root, TrieVersion::V1).unwrap();
    assert_eq!(loaded.get(b"large").unwrap().as_deref(), Some(&large[..]));
    assert_eq!(loaded.get(b"small").unwrap().as_deref(), Some(&b"s"[..]));
}

#[test]
fn test_cache_serves_repeated_lookups() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    let cache = Arc::new(TrieCache::new());
    let loaded = Trie::load(db, root, TrieVersion::V0)
        .unwrap()
        .with_cache(cache.clone());

    loaded.get(b"alpha").unwrap();
    let after_first = cache.stats();
    loaded.get(b"alpha").unwrap();
    let after_second = cache.stats();

    assert!(after_first.misses > 0);
    assert!(after_second.hits > after_first.hits);
}

#[test]
fn test_recorder_captures_lookup_path() {
    let db = Arc::new(MemoryDatabase::new());
    let (_, root) = build_and_flush(&db);

    let recorder = Arc::new(Mutex::new(Recorder::new()));
    let recording = Trie::load(db, root, TrieVersion::V0)
        .unwrap()
        .with_recorder(recorder.clone());
    recording.get(b"alphabet").unwrap();

    let records = recorder.lock().unwrap().drain();
    assert!(!records.is_empty());
    // Every recorded digest round-trips through its recorded data.
    for record in &records {
        assert_eq!(TrieVersion::V0.hash(&record.data), record.hash);
    }
}
