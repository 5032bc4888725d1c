//! GRIDCORE - Region
//! Thread-safe owner of one region partition's entries.
//!
//! ## Concurrency Model
//! - The entry table is a sharded concurrent map; lookups never take a region lock
//! - Each mutation locks only its entry (value, stamp and lifecycle change together)
//! - LRU touches are lock-free; eviction runs inline or on a worker thread
//! - A fault-in blocks the calling thread and that entry only
//!
//! `Region` is a cheap clone over shared state, like an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{EvictionLimit, MemoryTier, RegionConfig};
use crate::error::{GridError, Result};
use crate::types::{now_ms, Key, Value};

use super::entry::{EntryEnv, EntrySnapshot, Lifecycle, Mutation, RegionEntry, Write};
use super::event::{EntryEvent, EventOrigin, EventSink, Operation, RemoteUpdate};
use super::factory::{EntryContext, EntryFactory};
use super::gate::{AccessMode, EntryAccess, ReadOnlyAccess, ReadWriteAccess};
use super::lru::{
    EvictionHost, EvictionReport, EvictionState, EvictionWorker, LruController, WorkerStop,
};
use super::metrics::RegionStats;
use super::overflow::{DiskStore, OverflowFile};
use super::table::EntryTable;
use super::tombstone::TombstoneIndex;
use super::value::{StoredValue, ValueStore};
use super::version::{UpdateOutcome, VersionStamp};

/// One record of an authoritative resync snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRecord {
    pub key: Key,
    /// `None` installs a tombstone.
    pub value: Option<Value>,
    pub stamp: VersionStamp,
}

/// Shared region state. Everything a worker thread needs.
pub(crate) struct RegionCore {
    config: RegionConfig,
    factory: EntryFactory,
    overhead: usize,
    table: EntryTable,
    store: ValueStore,
    lru: Option<LruController>,
    tombstones: TombstoneIndex,
    stats: RegionStats,
    events: RwLock<Option<Arc<dyn EventSink>>>,
    closed: AtomicBool,
    consecutive_disk_failures: AtomicU32,
    /// Set when eviction runs on a worker, so a self-close can stop it.
    worker_stop: Mutex<Option<WorkerStop>>,
}

impl EvictionHost for RegionCore {
    fn entry_env(&self) -> EntryEnv<'_> {
        self.env()
    }

    fn unlink(&self, entry: &Arc<RegionEntry>) {
        self.table.remove(entry);
    }
}

impl RegionCore {
    fn env(&self) -> EntryEnv<'_> {
        EntryEnv {
            store: &self.store,
            overhead: self.overhead,
            member: self.config.local_member,
            now_ms: now_ms(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GridError::RegionClosed);
        }
        Ok(())
    }

    fn versioned(&self) -> bool {
        self.config.versioning
    }

    fn entry_for(&self, key: &Key) -> Arc<RegionEntry> {
        self.table
            .get_or_insert_with(key, || {
                self.factory.create_entry(key.clone(), StoredValue::Absent)
            })
            .0
    }

    /// Apply a local write, retrying if the entry is detached underneath us.
    fn write_local(
        &self,
        key: &Key,
        operation: Operation,
        value: Option<Value>,
        only_if_absent: bool,
    ) -> Result<Option<(Arc<RegionEntry>, Mutation)>> {
        loop {
            let entry = match operation {
                Operation::Update => self.entry_for(key),
                Operation::Invalidate | Operation::Destroy => match self.table.get(key) {
                    Some(entry) => entry,
                    None => return Ok(None),
                },
            };
            match entry.write_local(operation, value.clone(), only_if_absent, &self.env())? {
                Write::Detached => continue,
                Write::Skipped => return Ok(None),
                Write::Done(mutation) => return Ok(Some((entry, mutation))),
            }
        }
    }

    /// Bookkeeping shared by every applied mutation.
    fn after_write(&self, entry: &Arc<RegionEntry>, mutation: &Mutation) {
        if let Some(lru) = &self.lru {
            lru.account(mutation.change);
            if mutation.lifecycle.is_live() {
                lru.touch(entry);
            }
        }

        if mutation.lifecycle == Lifecycle::Tombstone {
            let env = self.env();
            if self.versioned() {
                self.tombstones.register(entry, mutation.generation, env.now_ms);
            } else if entry.expire_tombstone(mutation.generation, &env) {
                self.table.remove(entry);
            }
        }

        if self.tombstones.has_expired(now_ms()) {
            self.expire_tombstones();
        }
        self.maybe_evict();
    }

    fn emit(&self, event: EntryEvent) {
        let sink = self.events.read().clone();
        if let Some(sink) = sink {
            sink.on_event(event);
        }
    }

    fn maybe_evict(&self) {
        let Some(lru) = &self.lru else {
            return;
        };
        if lru.over_capacity() && !lru.evicting_in_background() {
            self.run_eviction();
        }
    }

    /// One eviction pass on the calling thread.
    fn run_eviction(&self) -> EvictionReport {
        let Some(lru) = &self.lru else {
            return EvictionReport::default();
        };
        let Some(report) = lru.evict(self) else {
            return EvictionReport::default();
        };

        RegionStats::add(&self.stats.fault_outs, report.faulted_out);
        RegionStats::add(&self.stats.evict_destroys, report.destroyed);
        if let Some(err) = &report.failure {
            RegionStats::add(&self.stats.fault_out_failures, 1);
            let failures = self.consecutive_disk_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= self.config.max_consecutive_disk_failures {
                log::error!(
                    "Region '{}' closing after {} consecutive fault-out failures (last: {})",
                    self.config.name,
                    failures,
                    err
                );
                self.closed.store(true, Ordering::Release);
                if let Some(stop) = self.worker_stop.lock().as_ref() {
                    stop.stop();
                }
            }
        } else if report.faulted_out > 0 {
            self.consecutive_disk_failures.store(0, Ordering::Release);
        }
        report
    }

    fn expire_tombstones(&self) -> usize {
        let env = self.env();
        let mut expired = 0;
        for (entry, generation) in self.tombstones.take_expired(env.now_ms) {
            if entry.expire_tombstone(generation, &env) {
                self.table.remove(&entry);
                expired += 1;
            }
        }
        if expired > 0 {
            RegionStats::add(&self.stats.expired_tombstones, expired);
            log::debug!("Expired {} tombstones in region '{}'", expired, self.config.name);
        }
        expired
    }
}

struct RegionInner {
    core: Arc<RegionCore>,
    worker: Option<EvictionWorker>,
}

/// Thread-safe handle to one region.
///
/// ## Example
/// ```no_run
/// use gridcore::config::{EvictionConfig, RegionConfig};
/// use gridcore::engine::region::Region;
///
/// let config = RegionConfig::new("orders", "./data")
///     .with_eviction(EvictionConfig::overflow_entries(10_000));
/// let region = Region::open(config).unwrap();
///
/// region.put("order:1", "pending").unwrap();
/// assert_eq!(region.get(&"order:1".into()).unwrap().as_deref(), Some(&b"pending"[..]));
/// ```
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl Region {
    /// Open a region, creating its overflow file if it overflows to disk.
    pub fn open(config: RegionConfig) -> Result<Self> {
        config.validate()?;
        let disk: Option<Arc<dyn DiskStore>> = if config.overflows_to_disk() {
            config.ensure_dirs()?;
            let file = OverflowFile::open(config.overflow_path(), config.sync_writes)?;
            Some(Arc::new(file))
        } else {
            None
        };
        Self::build(config, disk)
    }

    /// Open a region over a caller-supplied disk store.
    pub fn with_disk_store(config: RegionConfig, disk: Arc<dyn DiskStore>) -> Result<Self> {
        config.validate()?;
        Self::build(config, Some(disk))
    }

    fn build(config: RegionConfig, disk: Option<Arc<dyn DiskStore>>) -> Result<Self> {
        if config.overflows_to_disk() && disk.is_none() {
            return Err(GridError::Config("overflow eviction needs a disk store".into()));
        }
        let factory = EntryFactory::new(EntryContext::from_config(&config));
        let overhead = factory.entry_class().estimated_overhead();
        let background = config.eviction.as_ref().map_or(false, |e| e.background);
        let lru = config
            .eviction
            .as_ref()
            .map(|eviction| LruController::new(eviction, overhead));

        let core = Arc::new(RegionCore {
            factory,
            overhead,
            table: EntryTable::new(),
            store: ValueStore::new(config.memory_tier, disk, config.disk_retry_attempts),
            lru,
            tombstones: TombstoneIndex::new(config.tombstone_timeout),
            stats: RegionStats::new(),
            events: RwLock::new(None),
            closed: AtomicBool::new(false),
            consecutive_disk_failures: AtomicU32::new(0),
            worker_stop: Mutex::new(None),
            config,
        });

        let worker = if background {
            let weak: Weak<RegionCore> = Arc::downgrade(&core);
            let worker = EvictionWorker::spawn(&core.config.name, move || {
                if let Some(core) = weak.upgrade() {
                    core.run_eviction();
                }
            })?;
            *core.worker_stop.lock() = Some(worker.stopper());
            if let Some(lru) = &core.lru {
                lru.set_background(true);
            }
            Some(worker)
        } else {
            None
        };

        log::info!(
            "Region '{}' opened ({}, eviction {:?})",
            core.config.name,
            core.factory.entry_class().name(),
            core.lru.as_ref().map(|lru| lru.limit())
        );
        Ok(Self {
            inner: Arc::new(RegionInner { core, worker }),
        })
    }

    fn core(&self) -> &RegionCore {
        &self.inner.core
    }

    /// Wake the background worker if the region is over capacity.
    fn request_eviction(&self) {
        if let (Some(worker), Some(lru)) = (&self.inner.worker, &self.core().lru) {
            if lru.over_capacity() {
                worker.request();
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.core().config.name
    }

    pub fn config(&self) -> &RegionConfig {
        &self.core().config
    }

    /// The factory, for representation introspection.
    pub fn factory(&self) -> &EntryFactory {
        &self.core().factory
    }

    pub fn stats(&self) -> &RegionStats {
        &self.core().stats
    }

    /// Write a value. Returns the new stamp when the region is versioned.
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<VersionStamp>> {
        let core = self.core();
        core.check_open()?;
        let key = key.into();
        let value = value.into();
        let (entry, mutation) = core
            .write_local(&key, Operation::Update, Some(value.clone()), false)?
            .ok_or_else(|| GridError::Corruption(format!("unconditional put of {} was skipped", key)))?;
        RegionStats::add(&core.stats.puts, 1);
        core.after_write(&entry, &mutation);
        self.request_eviction();
        core.emit(EntryEvent {
            key,
            value: Some(value),
            stamp: mutation.stamp,
            operation: Operation::Update,
            origin: EventOrigin::Local,
            outcome: mutation.outcome,
        });
        Ok(mutation.stamp)
    }

    /// Write only if the key is absent or tombstoned. Returns true if written.
    pub fn create(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        let core = self.core();
        core.check_open()?;
        let key = key.into();
        let value = value.into();
        let Some((entry, mutation)) =
            core.write_local(&key, Operation::Update, Some(value.clone()), true)?
        else {
            return Ok(false);
        };
        RegionStats::add(&core.stats.puts, 1);
        core.after_write(&entry, &mutation);
        self.request_eviction();
        core.emit(EntryEvent {
            key,
            value: Some(value),
            stamp: mutation.stamp,
            operation: Operation::Update,
            origin: EventOrigin::Local,
            outcome: mutation.outcome,
        });
        Ok(true)
    }

    /// Read a value, faulting it in from the overflow tier if it was evicted.
    ///
    /// A fault-in failure is returned as `GridError::FaultIn`, never as `None`.
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        let core = self.core();
        core.check_open()?;
        let Some(entry) = core.table.get(key) else {
            core.stats.record_get(false);
            return Ok(None);
        };

        let outcome = match entry.read(&core.env()) {
            Ok(outcome) => outcome,
            Err(err) => {
                RegionStats::add(&core.stats.fault_in_failures, 1);
                log::warn!("Read of {} in region '{}' failed: {}", key, core.config.name, err);
                return Err(err);
            }
        };
        core.stats.record_get(outcome.value.is_some());
        if let Some(lru) = &core.lru {
            lru.account(outcome.change);
            if outcome.value.is_some() {
                lru.touch(&entry);
            }
        }
        if outcome.faulted_in {
            RegionStats::add(&core.stats.fault_ins, 1);
            core.maybe_evict();
            self.request_eviction();
        }
        Ok(outcome.value)
    }

    /// A consistent snapshot of the entry for `key`, including tombstones.
    pub fn get_entry(&self, key: &Key) -> Result<Option<EntrySnapshot>> {
        let core = self.core();
        core.check_open()?;
        match core.table.get(key) {
            Some(entry) => entry.snapshot(&core.store).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a key. Versioned regions keep a tombstone; others drop the entry.
    pub fn destroy(&self, key: &Key) -> Result<bool> {
        self.local_removal(key, Operation::Destroy)
    }

    /// Drop the value but keep the entry and its stamp.
    pub fn invalidate(&self, key: &Key) -> Result<bool> {
        self.local_removal(key, Operation::Invalidate)
    }

    fn local_removal(&self, key: &Key, operation: Operation) -> Result<bool> {
        let core = self.core();
        core.check_open()?;
        let Some((entry, mutation)) = core.write_local(key, operation, None, false)? else {
            return Ok(false);
        };
        let counter = match operation {
            Operation::Destroy => &core.stats.destroys,
            _ => &core.stats.invalidates,
        };
        RegionStats::add(counter, 1);
        core.after_write(&entry, &mutation);
        core.emit(EntryEvent {
            key: key.clone(),
            value: None,
            stamp: mutation.stamp,
            operation,
            origin: EventOrigin::Local,
            outcome: mutation.outcome,
        });
        Ok(true)
    }

    /// Deliver a replicated update. Staleness and lost ties are outcomes, not errors.
    pub fn apply_remote(&self, update: RemoteUpdate) -> Result<UpdateOutcome> {
        let core = self.core();
        core.check_open()?;
        let (entry, mutation, created) = loop {
            let (entry, created) = core.table.get_or_insert_with(&update.key, || {
                core.factory.create_entry(update.key.clone(), StoredValue::Absent)
            });
            match entry.observe_update(
                update.stamp,
                update.operation,
                update.value.clone(),
                &core.env(),
            ) {
                Write::Done(mutation) => break (entry, mutation, created),
                Write::Detached | Write::Skipped => continue,
            }
        };

        core.stats.record_remote(mutation.outcome);
        if mutation.outcome.is_applied() {
            core.after_write(&entry, &mutation);
            self.request_eviction();
        } else {
            log::debug!(
                "Rejected remote update for {} ({:?}): incoming {} vs current {:?}",
                update.key,
                mutation.outcome,
                update.stamp,
                mutation.stamp
            );
            if created && entry.expire_tombstone(mutation.generation, &core.env()) {
                core.table.remove(&entry);
            }
        }
        core.emit(EntryEvent {
            key: update.key,
            value: update.value,
            stamp: Some(update.stamp),
            operation: update.operation,
            origin: EventOrigin::Remote,
            outcome: mutation.outcome,
        });
        Ok(mutation.outcome)
    }

    /// Install an authoritative snapshot. Entries missing from it are tombstoned.
    /// This is the only operation that may move an entry's version backwards.
    pub fn resync(&self, snapshot: Vec<ResyncRecord>) -> Result<usize> {
        let core = self.core();
        core.check_open()?;
        let marked = core
            .table
            .entries()
            .iter()
            .filter(|entry| entry.mark_recovering())
            .count();

        let installed = snapshot.len();
        for record in snapshot {
            loop {
                let entry = core.entry_for(&record.key);
                match entry.install_resync(record.stamp, record.value.clone(), &core.env()) {
                    Write::Done(mutation) => {
                        core.after_write(&entry, &mutation);
                        break;
                    }
                    Write::Detached | Write::Skipped => continue,
                }
            }
        }

        let mut dropped = 0;
        for entry in core.table.entries() {
            if let Some(mutation) = entry.finish_recovering(&core.env()) {
                core.after_write(&entry, &mutation);
                dropped += 1;
            }
        }
        self.request_eviction();
        log::info!(
            "Region '{}' resynchronized: {} marked, {} installed, {} tombstoned",
            core.config.name,
            marked,
            installed,
            dropped
        );
        Ok(dropped)
    }

    /// True if the key holds a value, resident or overflowed.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.core()
            .table
            .get(key)
            .map_or(false, |entry| entry.lifecycle().is_live())
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.core()
            .table
            .entries()
            .iter()
            .filter(|entry| entry.lifecycle().is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries in the table, including invalid entries and tombstones.
    pub fn entry_count(&self) -> usize {
        self.core().table.len()
    }

    /// Number of values held in memory.
    pub fn resident_count(&self) -> usize {
        match &self.core().lru {
            Some(lru) => lru.resident_entries(),
            None => self
                .core()
                .table
                .entries()
                .iter()
                .filter(|entry| entry.is_resident())
                .count(),
        }
    }

    pub fn is_resident(&self, key: &Key) -> bool {
        self.core()
            .table
            .get(key)
            .map_or(false, |entry| entry.is_resident())
    }

    /// Bytes held by the off-heap arena.
    pub fn offheap_bytes(&self) -> usize {
        match self.core().store.tier() {
            MemoryTier::OffHeap => self.core().store.offheap().used_bytes(),
            MemoryTier::Heap => 0,
        }
    }

    pub fn eviction_limit(&self) -> Option<EvictionLimit> {
        self.core().lru.as_ref().map(|lru| lru.limit())
    }

    pub fn eviction_state(&self) -> Option<EvictionState> {
        self.core().lru.as_ref().map(|lru| lru.state())
    }

    /// Adjust the eviction limit of the live region.
    pub fn set_eviction_limit(&self, limit: usize) -> Result<()> {
        let core = self.core();
        core.check_open()?;
        let lru = core
            .lru
            .as_ref()
            .ok_or_else(|| GridError::Config("region has no eviction configured".into()))?;
        lru.set_limit(limit);
        core.maybe_evict();
        self.request_eviction();
        Ok(())
    }

    /// Run an eviction pass on the calling thread. Returns the number of
    /// entries evicted.
    pub fn evict_now(&self) -> Result<usize> {
        let core = self.core();
        core.check_open()?;
        let report = core.run_eviction();
        match report.failure {
            Some(err) => Err(err),
            None => Ok(report.evicted()),
        }
    }

    /// Block until pending background eviction has run.
    pub fn wait_for_evictions(&self) {
        match &self.inner.worker {
            Some(worker) => worker.flush(),
            None => {
                self.core().run_eviction();
            }
        }
    }

    /// Physically remove tombstones whose timeout has elapsed.
    pub fn expire_tombstones(&self) -> usize {
        self.core().expire_tombstones()
    }

    /// Remove every entry and release its storage.
    pub fn clear(&self) -> Result<()> {
        let core = self.core();
        core.check_open()?;
        let env = core.env();
        let entries = core.table.drain();
        for entry in &entries {
            entry.detach(&env);
        }
        if let Some(lru) = &core.lru {
            lru.reset();
        }
        core.tombstones.clear();
        log::info!("Region '{}' cleared ({} entries)", core.config.name, entries.len());
        Ok(())
    }

    /// A capability-restricted handle for a cache-provider bridge.
    pub fn access(&self, mode: AccessMode) -> Box<dyn EntryAccess> {
        match mode {
            AccessMode::ReadOnly => Box::new(ReadOnlyAccess::new(self.clone())),
            AccessMode::ReadWrite => Box::new(ReadWriteAccess::new(self.clone())),
        }
    }

    /// Deliver every local write and remote update to `sink`.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.core().events.write() = Some(sink);
    }

    pub fn clear_event_sink(&self) {
        *self.core().events.write() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.core().closed.load(Ordering::Acquire)
    }

    /// Close the region. In-flight eviction finishes first; later operations
    /// fail with `RegionClosed`.
    pub fn close(&self) -> Result<()> {
        let core = self.core();
        let already_closed = core.closed.swap(true, Ordering::AcqRel);
        // Joins a worker still finishing after the region closed itself.
        if let Some(worker) = &self.inner.worker {
            worker.shutdown();
        }
        if already_closed {
            return Ok(());
        }
        log::info!(
            "Region '{}' closed ({} entries, {} resident)",
            core.config.name,
            core.table.len(),
            self.resident_count()
        );
        Ok(())
    }
}
