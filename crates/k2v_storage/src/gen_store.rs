//! Generational store — layers up to three generations in one directory.
//!
//! ```text
//! generations[0]  young  (A)  the only generation accepting writes
//! generations[1]  fat    (A)  frozen, being folded into the old generation
//! generations[2]  old    (B)  output of earlier compactions
//! ```
//!
//! When the young generation's load factor drops to the rotation threshold,
//! the next writer spawns a fresh young generation and a background thread
//! folds the previous one into the old generation: directly by compaction
//! when there is no old generation, otherwise by merge (followed by a
//! recompaction once the old generation itself is mostly garbage).
//!
//! Reads walk the generations youngest first. A folder handle's version says
//! which generations can possibly hold its contents; older-only handles skip
//! the young generations entirely.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use k2v_common::config::{StoreConfig, SyncMode};
use k2v_common::error::{StoreError, StoreResult};
use parking_lot::{Mutex, RwLock};

use crate::api::{K2v, Query, Update};
use crate::generation::{Generation, GenerationQuery, GenerationStats, GenerationUpdate};
use crate::naming::{self, Family};
use crate::retry;
use crate::value::{Folder, Missing, Value};

/// Point-in-time view of the store's generations and background work.
#[derive(Debug, Clone)]
pub struct GenStoreStats {
    /// Youngest first.
    pub generations: Vec<GenerationStats>,
    pub rotations: u64,
    pub compactions: u64,
    pub merges: u64,
    pub recompactions: u64,
    pub compaction_failures: u64,
    pub compaction_in_flight: bool,
}

#[derive(Debug, Default)]
struct Counters {
    rotations: AtomicU64,
    compactions: AtomicU64,
    merges: AtomicU64,
    recompactions: AtomicU64,
    compaction_failures: AtomicU64,
}

struct Shared {
    dir: PathBuf,
    config: StoreConfig,
    /// Youngest first. Replaced wholesale, never mutated in place.
    generations: RwLock<Arc<Vec<Arc<Generation>>>>,
    compacting: AtomicBool,
    compaction: Mutex<Option<JoinHandle<()>>>,
    /// Failure of the last background compaction, surfaced once.
    failure: Mutex<Option<StoreError>>,
    next_young: AtomicU32,
    next_old: AtomicU32,
    counters: Counters,
}

/// Clears the in-flight flag however the compaction thread exits.
struct CompactingFlag<'a>(&'a AtomicBool);

impl Drop for CompactingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn family_of(generation: &Generation) -> Option<Family> {
    naming::parse(generation.name()).map(|(family, _)| family)
}

impl Shared {
    fn snapshot(&self) -> Arc<Vec<Arc<Generation>>> {
        Arc::clone(&self.generations.read())
    }

    fn publish(&self, generations: Vec<Arc<Generation>>) {
        let names: Vec<&str> = generations.iter().map(|g| g.name()).collect();
        tracing::debug!(generations = ?names, "published generations");
        *self.generations.write() = Arc::new(generations);
    }

    /// Allocate the next file name in `family`, clearing any stale file.
    fn next_path(&self, family: Family) -> StoreResult<PathBuf> {
        let counter = match family {
            Family::Young => &self.next_young,
            Family::Old => &self.next_old,
        };
        let id = counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(naming::file_name(family, id));
        retry::reuse(&path)?;
        Ok(path)
    }

    /// Freeze the head and hand it to a compaction thread. Caller holds the
    /// head's writer through `base`.
    fn rotate(self: &Arc<Self>, base: &mut GenerationUpdate, current: &[Arc<Generation>]) -> StoreResult<()> {
        if current.len() >= 2 && family_of(&current[1]) == Some(Family::Young) {
            tracing::info!(fat = %current[1].name(), "resuming interrupted compaction");
            return self.start_compaction(Arc::clone(&current[1]), current.get(2).cloned());
        }
        let path = self.next_path(Family::Young)?;
        let young = base.spawn(&path)?;
        let fat = Arc::clone(&current[0]);
        let old = current.get(1).cloned();

        self.compacting.store(true, Ordering::SeqCst);
        let mut next = vec![young, Arc::clone(&fat)];
        next.extend(old.clone());
        self.publish(next);
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            fat = %fat.name(),
            load_factor = fat.load_factor(),
            "rotated young generation"
        );
        self.start_compaction(fat, old)
    }

    fn start_compaction(self: &Arc<Self>, fat: Arc<Generation>, old: Option<Arc<Generation>>) -> StoreResult<()> {
        self.compacting.store(true, Ordering::SeqCst);
        let mut slot = self.compaction.lock();
        if let Some(previous) = slot.take() {
            if previous.join().is_err() {
                tracing::error!("previous compaction thread panicked");
            }
        }
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("k2v-compaction".into())
            .spawn(move || {
                let _flag = CompactingFlag(&shared.compacting);
                if let Err(e) = shared.run_compaction(fat, old) {
                    shared.counters.compaction_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "compaction failed, reporting to next writer");
                    *shared.failure.lock() = Some(e);
                }
            });
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.compacting.store(false, Ordering::SeqCst);
                tracing::error!("failed to spawn compaction thread: {}", e);
                Err(e.into())
            }
        }
    }

    fn run_compaction(&self, fat: Arc<Generation>, old: Option<Arc<Generation>>) -> StoreResult<()> {
        let started = Instant::now();
        let mut dead = vec![Arc::clone(&fat)];
        let target = match old {
            None => self.compact_into_new(&fat)?,
            Some(old) => {
                old.merge(&fat)?;
                self.counters.merges.fetch_add(1, Ordering::Relaxed);
                if old.load_factor() < self.config.recompact_load_factor {
                    let compacted = self.compact_into_new(&old)?;
                    self.counters.recompactions.fetch_add(1, Ordering::Relaxed);
                    dead.push(old);
                    compacted
                } else {
                    old
                }
            }
        };

        {
            let mut generations = self.generations.write();
            let head = Arc::clone(&generations[0]);
            *generations = Arc::new(vec![head, Arc::clone(&target)]);
        }

        for generation in &dead {
            if let Err(e) = generation.close() {
                tracing::warn!(generation = %generation.name(), error = %e, "close failed");
            }
            retry::remove_file(generation.path())?;
        }
        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target_gen = %target.name(),
            retired = dead.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "compaction complete"
        );
        Ok(())
    }

    fn compact_into_new(&self, source: &Generation) -> StoreResult<Arc<Generation>> {
        let path = self.next_path(Family::Old)?;
        source.compact(&path).map_err(|e| {
            if let Err(cleanup) = retry::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %cleanup, "could not remove partial output");
            }
            e
        })
    }
}

/// Walks the store directory at open time. At most one truncated generation
/// is stepped over; a second one means the directory was damaged by
/// something other than an interrupted write.
struct Ladder<'a> {
    dir: &'a Path,
    sync_mode: SyncMode,
    discarded: Option<String>,
}

impl Ladder<'_> {
    fn discard(&mut self, path: &Path, cause: StoreError) -> StoreResult<()> {
        if let Some(previous) = &self.discarded {
            tracing::error!(previous = %previous, "second truncated generation");
            return Err(cause);
        }
        tracing::warn!(path = %path.display(), error = %cause, "discarding truncated generation");
        retry::remove_file(path)?;
        self.discarded = Some(path.display().to_string());
        Ok(())
    }

    fn open(&mut self, family: Family, id: u32) -> StoreResult<Option<Arc<Generation>>> {
        let path = self.dir.join(naming::file_name(family, id));
        match Generation::open(&path, self.sync_mode) {
            Ok(generation) => Ok(Some(generation)),
            Err(e) if e.is_truncated() => {
                self.discard(&path, e)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Two old generations mean a compaction was interrupted after creating
    /// its output. A complete output supersedes the older file; an
    /// incomplete one is dropped.
    fn open_old_pair(&mut self, older: u32, newer: u32) -> StoreResult<Option<Arc<Generation>>> {
        let newer_path = self.dir.join(naming::file_name(Family::Old, newer));
        let older_path = self.dir.join(naming::file_name(Family::Old, older));
        match Generation::open(&newer_path, self.sync_mode) {
            Ok(generation) if generation.is_complete() => {
                tracing::info!(
                    kept = %generation.name(),
                    removed = %older_path.display(),
                    "compaction output supersedes older generation"
                );
                retry::remove_file(&older_path)?;
                Ok(Some(generation))
            }
            Ok(generation) => {
                generation.close()?;
                drop(generation);
                tracing::warn!(path = %newer_path.display(), "dropping incomplete compaction output");
                retry::remove_file(&newer_path)?;
                self.open(Family::Old, older)
            }
            Err(e) if e.is_truncated() => {
                self.discard(&newer_path, e)?;
                self.open(Family::Old, older)
            }
            Err(e) => Err(e),
        }
    }
}

/// A directory of generations behaving as one transactional store.
pub struct GenStore {
    shared: Arc<Shared>,
}

impl GenStore {
    /// Initialize a new store in `dir`, which must hold no generation files.
    pub fn create(dir: &Path, config: StoreConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::misuse(e.to_string()))?;
        fs::create_dir_all(dir)?;
        if let Some(name) = naming::data_files(dir)?.first() {
            return Err(StoreError::Layout(format!("unexpected file: {}", name)));
        }
        let path = dir.join(naming::file_name(Family::Young, 1));
        let young = Generation::create(&path, &mut rand::thread_rng(), config.sync_mode)?;
        tracing::info!(dir = %dir.display(), "created store");
        Ok(Self::assemble(dir, config, vec![young], 2, 1))
    }

    /// Open an existing store, repairing whatever an interrupted rotation or
    /// compaction left behind.
    pub fn open(dir: &Path, config: StoreConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::misuse(e.to_string()))?;
        let layout = naming::scan(dir)?;
        let mut ladder = Ladder {
            dir,
            sync_mode: config.sync_mode,
            discarded: None,
        };

        let (young_id, fat_id) = match layout.young.as_slice() {
            [young] => (*young, None),
            [fat, young] => (*young, Some(*fat)),
            _ => return Err(StoreError::Layout("missing young generation file".into())),
        };
        let young = ladder.open(Family::Young, young_id)?;
        let fat = match fat_id {
            Some(id) => ladder.open(Family::Young, id)?,
            None => None,
        };
        let old = match layout.old.as_slice() {
            [] => None,
            [id] => ladder.open(Family::Old, *id)?,
            [older, newer] => ladder.open_old_pair(*older, *newer)?,
            _ => return Err(StoreError::Layout("too many old generation files".into())),
        };

        let mut generations: Vec<Arc<Generation>> = [young, fat, old].into_iter().flatten().collect();
        let mut next_young = layout.next_id(Family::Young);
        let next_old = layout.next_id(Family::Old);
        let head_family = generations.first().and_then(|g| family_of(g));
        match head_family {
            None => return Err(StoreError::Layout("no usable generation".into())),
            Some(Family::Old) => {
                let path = dir.join(naming::file_name(Family::Young, next_young));
                next_young += 1;
                retry::reuse(&path)?;
                let young = generations[0].spawn(&path)?;
                generations.insert(0, young);
            }
            Some(Family::Young) => {}
        }

        let names: Vec<&str> = generations.iter().map(|g| g.name()).collect();
        tracing::info!(dir = %dir.display(), generations = ?names, "opened store");
        let pending = generations.len() >= 2 && family_of(&generations[1]) == Some(Family::Young);
        let store = Self::assemble(dir, config, generations, next_young, next_old);
        if pending {
            let current = store.shared.snapshot();
            store
                .shared
                .start_compaction(Arc::clone(&current[1]), current.get(2).cloned())?;
        }
        Ok(store)
    }

    fn assemble(
        dir: &Path,
        config: StoreConfig,
        generations: Vec<Arc<Generation>>,
        next_young: u32,
        next_old: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                dir: dir.to_path_buf(),
                config,
                generations: RwLock::new(Arc::new(generations)),
                compacting: AtomicBool::new(false),
                compaction: Mutex::new(None),
                failure: Mutex::new(None),
                next_young: AtomicU32::new(next_young),
                next_old: AtomicU32::new(next_old),
                counters: Counters::default(),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Block until the current background compaction (if any) finishes and
    /// report its outcome.
    pub fn wait_for_compaction(&self) -> StoreResult<()> {
        let handle = self.shared.compaction.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StoreError::Compaction("compaction thread panicked".into()))?;
        }
        match self.shared.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> GenStoreStats {
        let c = &self.shared.counters;
        GenStoreStats {
            generations: self.shared.snapshot().iter().map(|g| g.stats()).collect(),
            rotations: c.rotations.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            merges: c.merges.load(Ordering::Relaxed),
            recompactions: c.recompactions.load(Ordering::Relaxed),
            compaction_failures: c.compaction_failures.load(Ordering::Relaxed),
            compaction_in_flight: self.shared.compacting.load(Ordering::SeqCst),
        }
    }

    /// File names of the current generations, youngest first.
    pub fn generation_names(&self) -> Vec<String> {
        self.shared
            .snapshot()
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }

    fn query_generations(&self) -> StoreResult<GenStoreQuery> {
        // hold the read lock so no generation in this list is closed before
        // its query is registered
        let generations = self.shared.generations.read();
        let layers = generations
            .iter()
            .map(|g| g.query())
            .collect::<StoreResult<Vec<_>>>()?;
        drop(generations);
        let root = layers
            .first()
            .map(|layer| layer.root().clone())
            .ok_or_else(|| StoreError::Layout("store has no generations".into()))?;
        Ok(GenStoreQuery { layers, root })
    }
}

impl K2v for GenStore {
    fn query(&self) -> StoreResult<Box<dyn Query>> {
        Ok(Box::new(self.query_generations()?))
    }

    fn update(&self) -> StoreResult<Box<dyn Update>> {
        if let Some(e) = self.shared.failure.lock().take() {
            return Err(e);
        }
        loop {
            let head = Arc::clone(&self.shared.snapshot()[0]);
            let mut update = match head.update() {
                Ok(update) => update,
                // rotated between the snapshot and the writer hand-off
                Err(StoreError::Frozen(_)) => continue,
                Err(e) => return Err(e),
            };
            let current = self.shared.snapshot();
            if !Arc::ptr_eq(&current[0], &head) {
                update.close();
                continue;
            }
            // a frozen generation still at [1] means its compaction failed
            let pending = current.len() >= 2 && family_of(&current[1]) == Some(Family::Young);
            let rotate = pending || head.load_factor() <= self.shared.config.rotate_load_factor;
            if !rotate || self.shared.compacting.load(Ordering::SeqCst) {
                return Ok(Box::new(update));
            }
            let rotated = self.shared.rotate(&mut update, &current);
            update.close();
            rotated?;
        }
    }

    fn close(&self) -> StoreResult<()> {
        let handle = self.shared.compaction.lock().take();
        let joined = match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| StoreError::Compaction("compaction thread panicked".into())),
            None => Ok(()),
        };
        let mut first_error = None;
        for generation in self.shared.snapshot().iter() {
            if let Err(e) = generation.close() {
                first_error.get_or_insert(e);
            }
        }
        joined?;
        if let Some(e) = self.shared.failure.lock().take() {
            return Err(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(dir = %self.shared.dir.display(), "closed store");
                Ok(())
            }
        }
    }
}

/// Snapshot across every generation, youngest first.
struct GenStoreQuery {
    layers: Vec<GenerationQuery>,
    root: Folder,
}

impl GenStoreQuery {
    fn check_folder(&self, folder: &Folder) -> StoreResult<()> {
        if folder.lineage() != self.root.lineage() {
            return Err(StoreError::misuse("folder belongs to a different store"));
        }
        Ok(())
    }

    /// Generations that may hold content for `folder`.
    fn layers_for<'a>(&'a self, folder: &'a Folder) -> impl Iterator<Item = &'a GenerationQuery> + 'a {
        self.layers
            .iter()
            .filter(move |layer| folder.version() >= layer.first_version())
    }
}

impl Query for GenStoreQuery {
    fn root(&self) -> &Folder {
        &self.root
    }

    fn find(&self, folder: &Folder, key: &[u8]) -> StoreResult<Value> {
        self.check_folder(folder)?;
        for layer in self.layers_for(folder) {
            match layer.find(folder, key)? {
                Value::Missing(missing) if !missing.is_absolute() => continue,
                value => return Ok(value),
            }
        }
        Ok(Value::Missing(Missing::relative()))
    }

    fn keys(&self, folder: &Folder) -> StoreResult<Vec<Vec<u8>>> {
        self.check_folder(folder)?;
        let mut keys = BTreeSet::new();
        for layer in self.layers_for(folder) {
            let (found, authoritative) = layer.list(folder)?;
            keys.extend(found);
            if authoritative {
                break;
            }
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> StoreConfig {
        StoreConfig {
            sync_mode: SyncMode::None,
            ..StoreConfig::default()
        }
    }

    fn put(store: &dyn K2v, key: &str, value: &[u8]) {
        let mut update = store.update().unwrap();
        let root = store.query().unwrap().root().clone();
        update.put(&root, key.as_bytes(), value).unwrap();
        update.commit().unwrap();
    }

    fn get(store: &dyn K2v, key: &str) -> Option<Vec<u8>> {
        let query = store.query().unwrap();
        match query.find(query.root(), key.as_bytes()).unwrap() {
            Value::Document(doc) => Some(doc.read_all().unwrap()),
            _ => None,
        }
    }

    /// Overwrite one key until the store has rotated `rotations` times.
    fn churn_until_rotated(store: &GenStore, rotations: u64) {
        let mut i = 0u32;
        while store.stats().rotations < rotations {
            put(store, "churn", &i.to_le_bytes());
            i += 1;
            assert!(i < 10_000, "store never rotated");
        }
        store.wait_for_compaction().unwrap();
    }

    #[test]
    fn test_create_then_reopen() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "a", b"1");
        store.close().unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(get(&store, "a").unwrap(), b"1");
        assert_eq!(store.generation_names(), vec!["A00000001.k2v"]);
        store.close().unwrap();
    }

    #[test]
    fn test_create_refuses_existing_store() {
        let dir = TempDir::new().unwrap();
        GenStore::create(dir.path(), test_config()).unwrap().close().unwrap();
        let err = GenStore::create(dir.path(), test_config()).err().unwrap();
        assert!(matches!(err, StoreError::Layout(_)));
    }

    #[test]
    fn test_open_requires_young_file() {
        let dir = TempDir::new().unwrap();
        let err = GenStore::open(dir.path(), test_config()).err().unwrap();
        assert!(matches!(err, StoreError::Layout(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_rotation_compacts_into_old() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "stable", b"kept");
        churn_until_rotated(&store, 1);

        assert_eq!(store.generation_names(), vec!["A00000002.k2v", "B00000001.k2v"]);
        assert!(!dir.path().join("A00000001.k2v").exists());
        assert_eq!(get(&store, "stable").unwrap(), b"kept");
        assert!(get(&store, "churn").is_some());
        assert!(get(&store, "absent").is_none());

        let stats = store.stats();
        assert_eq!(stats.compactions, 1);
        assert_eq!(stats.merges, 0);
        assert!(!stats.compaction_in_flight);
        store.close().unwrap();
    }

    #[test]
    fn test_pinned_query_does_not_stall_compaction() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "stable", b"kept");
        let pinned = store.query().unwrap();

        churn_until_rotated(&store, 1);
        let stats = store.stats();
        assert_eq!(stats.compactions, 1);
        assert!(!stats.compaction_in_flight);
        assert!(!dir.path().join("A00000001.k2v").exists());

        churn_until_rotated(&store, 2);
        assert_eq!(store.stats().merges, 1);
        assert_eq!(store.generation_names().len(), 2);

        let stable = pinned.find(pinned.root(), b"stable").unwrap();
        assert_eq!(stable.as_document().unwrap().read_all().unwrap(), b"kept");
        assert!(pinned.find(pinned.root(), b"churn").unwrap().is_missing());
        assert_eq!(pinned.keys(pinned.root()).unwrap(), vec![b"stable".to_vec()]);
        drop(pinned);
        store.close().unwrap();
    }

    #[test]
    fn test_close_returns_while_query_is_open() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "a", b"1");
        let query = store.query().unwrap();

        store.close().unwrap();
        assert!(matches!(store.query(), Err(StoreError::Misuse(_))));
        let a = query.find(query.root(), b"a").unwrap();
        assert_eq!(a.as_document().unwrap().read_all().unwrap(), b"1");
    }

    #[test]
    fn test_second_rotation_merges() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "first", b"1");
        churn_until_rotated(&store, 1);
        put(&store, "second", b"2");
        churn_until_rotated(&store, 2);

        let stats = store.stats();
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.generations.len(), 2);
        assert_eq!(get(&store, "first").unwrap(), b"1");
        assert_eq!(get(&store, "second").unwrap(), b"2");
        store.close().unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(get(&store, "first").unwrap(), b"1");
        assert_eq!(get(&store, "second").unwrap(), b"2");
        store.close().unwrap();
    }

    #[test]
    fn test_old_folder_handle_skips_young_generation() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        {
            let mut update = store.update().unwrap();
            let root = store.query().unwrap().root().clone();
            let users = update.nest(&root, b"users").unwrap();
            update.put(&users, b"alice", b"admin").unwrap();
            update.commit().unwrap();
        }
        churn_until_rotated(&store, 1);

        let query = store.query().unwrap();
        let users = match query.find(query.root(), b"users").unwrap() {
            Value::Folder(folder) => folder,
            other => panic!("expected folder, got {:?}", other),
        };
        let young_first = store.stats().generations[0].first_version;
        assert!(users.version() < young_first);
        assert_eq!(
            query.find(&users, b"alice").unwrap().as_document().unwrap().read_all().unwrap(),
            b"admin"
        );
        assert_eq!(query.keys(&users).unwrap(), vec![b"alice".to_vec()]);
    }

    #[test]
    fn test_keys_union_across_generations() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "old", b"o");
        churn_until_rotated(&store, 1);
        put(&store, "young", b"y");

        let query = store.query().unwrap();
        let keys = query.keys(query.root()).unwrap();
        assert_eq!(keys, vec![b"churn".to_vec(), b"old".to_vec(), b"young".to_vec()]);
    }

    #[test]
    fn test_foreign_folder_is_misuse() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let a = GenStore::create(dir1.path(), test_config()).unwrap();
        let b = GenStore::create(dir2.path(), test_config()).unwrap();
        let foreign = b.query().unwrap().root().clone();
        let query = a.query().unwrap();
        assert!(matches!(query.find(&foreign, b"k"), Err(StoreError::Misuse(_))));
        let mut update = a.update().unwrap();
        assert!(matches!(update.touch(&foreign), Err(StoreError::Misuse(_))));
    }

    #[test]
    fn test_open_resumes_pending_compaction() {
        let dir = TempDir::new().unwrap();
        let genesis = Generation::create(&dir.path().join("A00000001.k2v"), &mut rand::thread_rng(), SyncMode::None).unwrap();
        put_generation(&genesis, "a", b"from-genesis");
        let young = genesis.spawn(&dir.path().join("A00000002.k2v")).unwrap();
        put_generation(&young, "b", b"from-young");
        genesis.close().unwrap();
        young.close().unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        store.wait_for_compaction().unwrap();
        assert_eq!(store.generation_names(), vec!["A00000002.k2v", "B00000001.k2v"]);
        assert!(!dir.path().join("A00000001.k2v").exists());
        assert_eq!(get(&store, "a").unwrap(), b"from-genesis");
        assert_eq!(get(&store, "b").unwrap(), b"from-young");
        store.close().unwrap();
    }

    #[test]
    fn test_truncated_young_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = GenStore::create(dir.path(), test_config()).unwrap();
        put(&store, "a", b"safe");
        churn_until_rotated(&store, 1);
        store.close().unwrap();

        let young = dir.path().join("A00000002.k2v");
        fs::OpenOptions::new().write(true).open(&young).unwrap().set_len(10).unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.generation_names(), vec!["A00000003.k2v", "B00000001.k2v"]);
        assert_eq!(get(&store, "a").unwrap(), b"safe");
        put(&store, "b", b"new");
        assert_eq!(get(&store, "b").unwrap(), b"new");
        store.close().unwrap();
    }

    #[test]
    fn test_two_truncated_generations_are_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("A00000002.k2v"), b"K2").unwrap();
        fs::write(dir.path().join("B00000001.k2v"), b"K2").unwrap();
        let err = GenStore::open(dir.path(), test_config()).err().unwrap();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_complete_newer_old_generation_wins() {
        let dir = TempDir::new().unwrap();
        let genesis = Generation::create(&dir.path().join("A00000001.k2v"), &mut rand::thread_rng(), SyncMode::None).unwrap();
        put_generation(&genesis, "a", b"1");
        let b1 = genesis.compact(&dir.path().join("B00000001.k2v")).unwrap();
        let b2 = b1.compact(&dir.path().join("B00000002.k2v")).unwrap();
        let young = b2.spawn(&dir.path().join("A00000002.k2v")).unwrap();
        for g in [&genesis, &b1, &b2, &young] {
            g.close().unwrap();
        }
        fs::remove_file(dir.path().join("A00000001.k2v")).unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.generation_names(), vec!["A00000002.k2v", "B00000002.k2v"]);
        assert!(!dir.path().join("B00000001.k2v").exists());
        assert_eq!(get(&store, "a").unwrap(), b"1");
        store.close().unwrap();
    }

    #[test]
    fn test_truncated_newer_old_generation_is_dropped() {
        let dir = TempDir::new().unwrap();
        let genesis = Generation::create(&dir.path().join("A00000001.k2v"), &mut rand::thread_rng(), SyncMode::None).unwrap();
        put_generation(&genesis, "a", b"1");
        let b1 = genesis.compact(&dir.path().join("B00000001.k2v")).unwrap();
        let young = b1.spawn(&dir.path().join("A00000002.k2v")).unwrap();
        for g in [&genesis, &b1, &young] {
            g.close().unwrap();
        }
        fs::remove_file(dir.path().join("A00000001.k2v")).unwrap();
        fs::write(dir.path().join("B00000002.k2v"), b"K2VG").unwrap();

        let store = GenStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.generation_names(), vec!["A00000002.k2v", "B00000001.k2v"]);
        assert!(!dir.path().join("B00000002.k2v").exists());
        assert_eq!(get(&store, "a").unwrap(), b"1");
        store.close().unwrap();
    }

    fn put_generation(generation: &Arc<Generation>, key: &str, value: &[u8]) {
        let mut update = generation.update().unwrap();
        let root = generation.query().unwrap().root().clone();
        update.put(&root, key.as_bytes(), value).unwrap();
        update.commit().unwrap();
    }
}
