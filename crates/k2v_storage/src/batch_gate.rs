//! Batch Gate — coalesces logical updates into shared physical commits.
//!
//! Callers of `update()` join the current batch (up to `capacity` of them)
//! and take turns holding the batch's physical update. Each logical commit
//! hands the physical update to the next joiner and waits; the last joiner
//! to finish (the master) performs the single physical commit and wakes
//! everyone with its outcome.
//!
//! Logical updates in one batch are not isolated from each other: closing a
//! non-master update without committing cannot undo what it already wrote to
//! the shared physical update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use k2v_common::config::StoreConfig;
use k2v_common::error::{StoreError, StoreResult};
use parking_lot::Mutex;

use crate::api::{ByteSink, K2v, Query, Update};
use crate::gate::{Gate, OneShot};
use crate::value::Folder;

/// Statistics for the batch gate.
#[derive(Debug, Default)]
pub struct BatchStats {
    /// Logical updates handed out.
    pub joins: AtomicU64,
    /// Batches opened.
    pub batches: AtomicU64,
    /// Physical commits attempted.
    pub physical_commits: AtomicU64,
    /// Physical commits that failed.
    pub failed_commits: AtomicU64,
    /// Batches whose master closed without committing.
    pub rollbacks: AtomicU64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            joins: self.joins.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            physical_commits: self.physical_commits.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of batch gate stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatsSnapshot {
    pub joins: u64,
    pub batches: u64,
    pub physical_commits: u64,
    pub failed_commits: u64,
    pub rollbacks: u64,
}

struct Joins {
    /// Seats left before the batch stops admitting joiners.
    remaining: usize,
    /// Joined, but not yet holding the physical update.
    pending: usize,
}

struct Batch {
    /// Guarded by the caboose lock as well; lock order is caboose, joins.
    joins: Mutex<Joins>,
    gate: Gate,
    /// The physical update while no joiner holds the gate.
    physical: Mutex<Option<Box<dyn Update>>>,
    outcome: OneShot<StoreResult<()>>,
}

/// The batch currently admitting joiners.
type Caboose = Arc<Mutex<Option<Arc<Batch>>>>;

/// Decorates a store so that concurrent writers share physical commits.
pub struct BatchGate<S> {
    base: S,
    capacity: usize,
    caboose: Caboose,
    stats: Arc<BatchStats>,
}

impl<S: K2v> BatchGate<S> {
    pub fn new(base: S, capacity: usize) -> Self {
        Self {
            base,
            capacity: capacity.max(1),
            caboose: Arc::new(Mutex::new(None)),
            stats: Arc::new(BatchStats::default()),
        }
    }

    pub fn with_config(base: S, config: &StoreConfig) -> Self {
        Self::new(base, config.batch_capacity)
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Take a seat in the current batch, opening a new one if needed.
    fn join(&self) -> Arc<Batch> {
        let mut caboose = self.caboose.lock();
        let batch = match caboose.as_ref() {
            Some(batch) => Arc::clone(batch),
            None => {
                let batch = Arc::new(Batch {
                    joins: Mutex::new(Joins {
                        remaining: self.capacity,
                        pending: 0,
                    }),
                    gate: Gate::new(),
                    physical: Mutex::new(None),
                    outcome: OneShot::new(),
                });
                *caboose = Some(Arc::clone(&batch));
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(capacity = self.capacity, "opened batch");
                batch
            }
        };
        {
            let mut joins = batch.joins.lock();
            joins.remaining -= 1;
            joins.pending += 1;
            if joins.remaining == 0 {
                *caboose = None;
            }
        }
        self.stats.joins.fetch_add(1, Ordering::Relaxed);
        batch
    }
}

impl<S: K2v> K2v for BatchGate<S> {
    fn query(&self) -> StoreResult<Box<dyn Query>> {
        self.base.query()
    }

    fn update(&self) -> StoreResult<Box<dyn Update>> {
        let batch = self.join();
        batch.gate.acquire();
        {
            let _caboose = self.caboose.lock();
            batch.joins.lock().pending -= 1;
        }
        let parked = batch.physical.lock().take();
        let physical = match parked {
            Some(update) => update,
            None => match self.base.update() {
                Ok(update) => update,
                Err(e) => {
                    batch.gate.release();
                    return Err(e);
                }
            },
        };
        Ok(Box::new(BatchUpdate {
            caboose: Arc::clone(&self.caboose),
            stats: Arc::clone(&self.stats),
            batch,
            physical: Some(physical),
            released: false,
            master: false,
        }))
    }

    fn close(&self) -> StoreResult<()> {
        self.base.close()
    }
}

/// One caller's view of a batch's physical update.
struct BatchUpdate {
    caboose: Caboose,
    stats: Arc<BatchStats>,
    batch: Arc<Batch>,
    /// Present while this update holds the batch gate.
    physical: Option<Box<dyn Update>>,
    released: bool,
    master: bool,
}

impl BatchUpdate {
    fn physical(&mut self) -> StoreResult<&mut Box<dyn Update>> {
        if self.released {
            return Err(StoreError::misuse("update is closed"));
        }
        self.physical
            .as_mut()
            .ok_or_else(|| StoreError::misuse("update is closed"))
    }

    /// Leave the batch. The last member to leave becomes the master and
    /// keeps the physical update; everyone else passes it on.
    fn release(&mut self) -> bool {
        if self.released {
            return self.master;
        }
        self.released = true;
        {
            let mut caboose = self.caboose.lock();
            self.master = self.batch.joins.lock().pending == 0;
            let current = caboose
                .as_ref()
                .map_or(false, |batch| Arc::ptr_eq(batch, &self.batch));
            if self.master && current {
                *caboose = None;
            }
        }
        if !self.master {
            *self.batch.physical.lock() = self.physical.take();
            self.batch.gate.release();
        }
        self.master
    }
}

impl Update for BatchUpdate {
    fn open(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<ByteSink<'_>> {
        self.physical()?.open(folder, key)
    }

    fn touch(&mut self, folder: &Folder) -> StoreResult<Folder> {
        self.physical()?.touch(folder)
    }

    fn nest(&mut self, folder: &Folder, key: &[u8]) -> StoreResult<Folder> {
        self.physical()?.nest(folder, key)
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.released {
            return Err(StoreError::misuse("update is closed"));
        }
        if !self.release() {
            return self.batch.outcome.wait();
        }
        let result = match self.physical.take() {
            Some(mut physical) => {
                let result = physical.commit();
                physical.close();
                result
            }
            None => Err(StoreError::misuse("batch has no physical update")),
        };
        self.stats.physical_commits.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            self.stats.failed_commits.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "batched commit failed");
        }
        self.batch.outcome.set(result.clone());
        self.batch.gate.release();
        result
    }

    fn close(&mut self) {
        if self.released {
            return;
        }
        if self.release() {
            if let Some(mut physical) = self.physical.take() {
                physical.close();
            }
            self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("batch master closed without commit, rolling back");
            self.batch.outcome.set(Err(StoreError::RolledBack));
            self.batch.gate.release();
        }
    }
}

impl Drop for BatchUpdate {
    fn drop(&mut self) {
        self.close();
    }
}
