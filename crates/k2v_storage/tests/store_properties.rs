//! End-to-end behaviour of the generational store and the batch gate:
//! durability across reopen, snapshot isolation, folder routing across
//! rotations, compaction fidelity and recovery from torn writes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use k2v_storage::{BatchGate, Folder, GenStore, Generation, K2v, Query, StoreConfig, SyncMode, Value};

fn config() -> StoreConfig {
    StoreConfig {
        sync_mode: SyncMode::None,
        ..StoreConfig::default()
    }
}

fn put(store: &dyn K2v, folder: Option<&Folder>, key: &[u8], value: &[u8]) {
    let mut update = store.update().unwrap();
    let root = store.query().unwrap().root().clone();
    update.put(folder.unwrap_or(&root), key, value).unwrap();
    update.commit().unwrap();
}

fn read(query: &dyn Query, folder: &Folder, key: &[u8]) -> Option<Vec<u8>> {
    match query.find(folder, key).unwrap() {
        Value::Document(doc) => Some(doc.read_all().unwrap()),
        Value::Missing(_) => None,
        Value::Folder(_) => panic!("{:?} is a folder", String::from_utf8_lossy(key)),
    }
}

fn get(store: &dyn K2v, key: &[u8]) -> Option<Vec<u8>> {
    let query = store.query().unwrap();
    read(query.as_ref(), query.root(), key)
}

fn rotate(store: &GenStore, rotations: u64) {
    let mut i = 0u32;
    while store.stats().rotations < rotations {
        put(store, None, b"churn", &i.to_le_bytes());
        i += 1;
        assert!(i < 10_000, "store never rotated");
    }
    store.wait_for_compaction().unwrap();
}

// ── durability ────────────────────────────────────────────────────────────

#[test]
fn test_deadbeef_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    put(&store, None, b"a", &[0xDE, 0xAD, 0xBE, 0xEF]);
    store.close().unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    assert_eq!(get(&store, b"a").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    store.close().unwrap();
}

#[test]
fn test_round_trip_payload_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let cases: Vec<(&[u8], Vec<u8>)> = vec![
        (&b"empty"[..], Vec::new()),
        (&b""[..], b"empty key".to_vec()),
        (&[0x00, 0xFF][..], vec![0u8; 17]),
        (&b"large"[..], large.clone()),
    ];
    for (key, value) in &cases {
        put(&store, None, key, value);
    }
    for (key, value) in &cases {
        assert_eq!(&get(&store, key).unwrap(), value);
    }
    store.close().unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    assert_eq!(get(&store, b"large").unwrap(), large);
    assert_eq!(get(&store, b"empty").unwrap(), Vec::<u8>::new());
    store.close().unwrap();
}

#[test]
fn test_nested_folders_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    {
        let mut update = store.update().unwrap();
        let root = store.query().unwrap().root().clone();
        let a = update.nest(&root, b"a").unwrap();
        let b = update.nest(&a, b"b").unwrap();
        update.put(&b, b"leaf", b"deep").unwrap();
        update.commit().unwrap();
    }
    store.close().unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    let query = store.query().unwrap();
    let a = query.find(query.root(), b"a").unwrap().as_folder().cloned().unwrap();
    let b = query.find(&a, b"b").unwrap().as_folder().cloned().unwrap();
    assert_eq!(b.path(), &[b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(read(query.as_ref(), &b, b"leaf").unwrap(), b"deep");
    assert_eq!(query.keys(&a).unwrap(), vec![b"b".to_vec()]);
    drop(query);
    store.close().unwrap();
}

// ── isolation ─────────────────────────────────────────────────────────────

#[test]
fn test_query_never_sees_later_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    put(&store, None, b"k", b"before");

    let snapshot = store.query().unwrap();
    let mut update = store.update().unwrap();
    let root = store.query().unwrap().root().clone();
    update.put(&root, b"k", b"after").unwrap();
    update.put(&root, b"new", b"x").unwrap();
    assert_eq!(read(snapshot.as_ref(), snapshot.root(), b"k").unwrap(), b"before");
    update.commit().unwrap();

    assert_eq!(read(snapshot.as_ref(), snapshot.root(), b"k").unwrap(), b"before");
    assert!(read(snapshot.as_ref(), snapshot.root(), b"new").is_none());
    assert_eq!(snapshot.keys(snapshot.root()).unwrap(), vec![b"k".to_vec()]);
    assert_eq!(get(&store, b"k").unwrap(), b"after");
}

#[test]
fn test_closed_update_discards_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    {
        let mut update = store.update().unwrap();
        let root = store.query().unwrap().root().clone();
        update.put(&root, b"ghost", b"boo").unwrap();
        update.close();
        assert!(update.commit().is_err());
    }
    assert!(get(&store, b"ghost").is_none());
    put(&store, None, b"real", b"1");
    assert_eq!(get(&store, b"real").unwrap(), b"1");
}

// ── routing across rotations ──────────────────────────────────────────────

#[test]
fn test_folder_handles_route_across_rotations() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    let mut handles = Vec::new();
    for round in 0..3u8 {
        let name = [b'f', b'0' + round];
        {
            let mut update = store.update().unwrap();
            let root = store.query().unwrap().root().clone();
            let folder = update.nest(&root, &name).unwrap();
            update.put(&folder, b"v", &[round]).unwrap();
            update.commit().unwrap();
        }
        let query = store.query().unwrap();
        let folder = query.find(query.root(), &name).unwrap().as_folder().cloned().unwrap();
        handles.push((folder, round));
        drop(query);
        rotate(&store, u64::from(round) + 1);
    }

    let query = store.query().unwrap();
    for (folder, round) in &handles {
        assert_eq!(read(query.as_ref(), folder, b"v").unwrap(), vec![*round]);
        assert_eq!(query.keys(folder).unwrap(), vec![b"v".to_vec()]);
    }
    drop(query);
    assert!(store.stats().merges >= 1);
    store.close().unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    let query = store.query().unwrap();
    for (folder, round) in &handles {
        assert_eq!(read(query.as_ref(), folder, b"v").unwrap(), vec![*round]);
    }
}

#[test]
fn test_document_replaced_by_folder_hides_older_generation() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    put(&store, None, b"node", b"was a document");
    rotate(&store, 1);
    {
        let mut update = store.update().unwrap();
        let root = store.query().unwrap().root().clone();
        let node = update.nest(&root, b"node").unwrap();
        update.put(&node, b"child", b"c").unwrap();
        update.commit().unwrap();
    }
    let query = store.query().unwrap();
    let node = query.find(query.root(), b"node").unwrap().as_folder().cloned().unwrap();
    assert_eq!(query.keys(&node).unwrap(), vec![b"child".to_vec()]);
    assert!(query.find(&node, b"missing").unwrap().is_missing());
}

// ── compaction ────────────────────────────────────────────────────────────

fn collect(query: &dyn Query, folder: &Folder, prefix: &mut Vec<Vec<u8>>, out: &mut Vec<(Vec<Vec<u8>>, Option<Vec<u8>>)>) {
    for key in query.keys(folder).unwrap() {
        prefix.push(key.clone());
        match query.find(folder, &key).unwrap() {
            Value::Document(doc) => out.push((prefix.clone(), Some(doc.read_all().unwrap()))),
            Value::Folder(child) => {
                out.push((prefix.clone(), None));
                collect(query, &child, prefix, out);
            }
            Value::Missing(_) => panic!("listed key is missing"),
        }
        prefix.pop();
    }
}

fn dump(generation: &Arc<Generation>) -> Vec<(Vec<Vec<u8>>, Option<Vec<u8>>)> {
    let query = generation.query().unwrap();
    let mut out = Vec::new();
    collect(&query, query.root(), &mut Vec::new(), &mut out);
    out
}

fn fill(generation: &Arc<Generation>) {
    use k2v_storage::Update;
    for round in 0..20u32 {
        let mut update = generation.update().unwrap();
        let root = generation.query().unwrap().root().clone();
        let users = update.nest(&root, b"users").unwrap();
        update
            .put(&users, format!("u{}", round % 7).as_bytes(), &round.to_be_bytes())
            .unwrap();
        if round % 5 == 0 {
            let logs = update.nest(&root, format!("log{}", round).as_bytes()).unwrap();
            update.put(&logs, b"entry", b"x").unwrap();
        }
        update.put(&root, b"counter", &round.to_le_bytes()).unwrap();
        update.commit().unwrap();
    }
}

#[test]
fn test_compaction_preserves_every_live_value() {
    let dir = tempfile::tempdir().unwrap();
    let source = Generation::create(&dir.path().join("A00000001.k2v"), &mut rand::thread_rng(), SyncMode::None).unwrap();
    fill(&source);
    let before = dump(&source);
    assert!(before.len() > 10);

    let compacted = source.compact(&dir.path().join("B00000001.k2v")).unwrap();
    assert_eq!(dump(&compacted), before);
    assert_eq!(compacted.last_version(), source.last_version());
    assert_eq!(compacted.first_version(), source.first_version());
    assert!(compacted.stats().file_len < source.stats().file_len);
    assert!(compacted.load_factor() > 0.9);

    let source_root = source.query().unwrap().root().clone();
    let compacted_query = compacted.query().unwrap();
    let users = compacted_query.find(&source_root, b"users").unwrap();
    let users = users.as_folder().unwrap();
    assert_eq!(compacted_query.keys(users).unwrap().len(), 7);
    drop(compacted_query);

    source.close().unwrap();
    compacted.close().unwrap();
    let reopened = Generation::open(&dir.path().join("B00000001.k2v"), SyncMode::None).unwrap();
    assert_eq!(dump(&reopened), before);
}

#[test]
fn test_store_contents_survive_repeated_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    for i in 0..50u32 {
        put(&store, None, format!("key{:02}", i).as_bytes(), &i.to_be_bytes());
    }
    rotate(&store, 3);
    for i in 0..50u32 {
        assert_eq!(get(&store, format!("key{:02}", i).as_bytes()).unwrap(), i.to_be_bytes());
    }
    let names = store.generation_names();
    assert_eq!(names.len(), 2, "{:?}", names);
    store.close().unwrap();
}

// ── crash recovery ────────────────────────────────────────────────────────

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

#[test]
fn test_torn_last_commit_is_lost_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    put(&store, None, b"kept", b"1");
    let young = dir.path().join(&store.generation_names()[0]);
    let committed = file_len(&young);
    put(&store, None, b"torn", b"2");
    store.close().unwrap();

    let torn_at = (committed + file_len(&young)) / 2;
    fs::OpenOptions::new().write(true).open(&young).unwrap().set_len(torn_at).unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    assert_eq!(get(&store, b"kept").unwrap(), b"1");
    assert!(get(&store, b"torn").is_none());
    put(&store, None, b"after", b"3");
    store.close().unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    assert_eq!(get(&store, b"kept").unwrap(), b"1");
    assert_eq!(get(&store, b"after").unwrap(), b"3");
    assert!(get(&store, b"torn").is_none());
}

#[test]
fn test_truncated_young_falls_back_to_old() {
    let dir = tempfile::tempdir().unwrap();
    let store = GenStore::create(dir.path(), config()).unwrap();
    put(&store, None, b"settled", b"old");
    rotate(&store, 1);
    store.close().unwrap();

    let young = dir.path().join("A00000002.k2v");
    fs::OpenOptions::new().write(true).open(&young).unwrap().set_len(3).unwrap();

    let store = GenStore::open(dir.path(), config()).unwrap();
    assert_eq!(get(&store, b"settled").unwrap(), b"old");
    assert!(!young.exists());
    put(&store, None, b"fresh", b"new");
    assert_eq!(get(&store, b"fresh").unwrap(), b"new");
    store.close().unwrap();
}

#[test]
fn test_unknown_generation_file_refuses_open() {
    let dir = tempfile::tempdir().unwrap();
    GenStore::create(dir.path(), config()).unwrap().close().unwrap();
    fs::write(dir.path().join("Z00000001.k2v"), b"junk").unwrap();
    assert!(GenStore::open(dir.path(), config()).is_err());
}

// ── batching over a real store ────────────────────────────────────────────

#[test]
fn test_batched_writers_reach_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config();
    let store = GenStore::create(dir.path(), cfg.clone()).unwrap();
    let gate = Arc::new(BatchGate::with_config(store, &cfg));

    let writers: Vec<_> = (0..16u8)
        .map(|i| {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || put(gate.as_ref(), None, &[b'w', i], &[i; 4]))
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let stats = gate.stats();
    assert_eq!(stats.joins, 16);
    assert!(stats.physical_commits >= 2 && stats.physical_commits <= 16);
    assert_eq!(stats.failed_commits, 0);
    gate.close().unwrap();

    let store = GenStore::open(dir.path(), cfg).unwrap();
    for i in 0..16u8 {
        assert_eq!(get(&store, &[b'w', i]).unwrap(), vec![i; 4]);
    }
}
