//! GRIDCORE - LRU Eviction Controller
//! Tracks recency across a region's entries and, under capacity pressure,
//! faults the least recently used values out to the overflow tier (or
//! destroys the entries when the region has no disk).
//!
//! ## Recency Tracking
//! A touch takes a tick from a global clock, stores it on the entry and pushes
//! `(entry, tick)` onto a lock-free injector. That is O(1) and never takes the
//! eviction lock. The evictor drains the injector into its own queue and pops
//! from the front; records whose tick no longer matches the entry's recency
//! were superseded by a later touch and are skipped. With one writer the
//! victim order is strictly least recently used.
//!
//! ## Fault-Out Protocol
//! ```text
//! 1. lock entry   -> copy resident value + generation, unlock
//! 2. write batch  -> overflow tier (no entry lock held)
//! 3. lock entry   -> commit token iff generation unchanged, else release token
//! ```
//! A failed write leaves every victim resident and requeued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use crate::config::{EvictionAction, EvictionConfig, EvictionLimit};
use crate::error::{GridError, Result};
use crate::types::{Key, Value};

use super::entry::{EntryEnv, Footprint, FootprintChange, RegionEntry};

/// Queue length above which stale records are compacted away,
/// in addition to four records per resident entry. Also the injector
/// length at which a touch drains it.
const COMPACT_SLACK: usize = 1024;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionState {
    UnderCapacity,
    Evicting,
}

/// What the controller needs from the region that owns the entries.
pub(crate) trait EvictionHost {
    fn entry_env(&self) -> EntryEnv<'_>;

    /// Remove a detached victim from the region table.
    fn unlink(&self, entry: &Arc<RegionEntry>);
}

/// Summary of one eviction pass.
#[derive(Debug, Default)]
pub struct EvictionReport {
    pub faulted_out: usize,
    pub destroyed: usize,
    /// Victims whose fault-out lost to a concurrent update.
    pub superseded: usize,
    /// Set when the overflow write failed; victims stay resident.
    pub failure: Option<GridError>,
}

impl EvictionReport {
    pub fn evicted(&self) -> usize {
        self.faulted_out + self.destroyed
    }
}

struct LruRecord {
    entry: Weak<RegionEntry>,
    tick: u64,
}

impl LruRecord {
    /// The entry, if this is still its latest record and it holds a resident value.
    fn candidate(&self) -> Option<Arc<RegionEntry>> {
        let entry = self.entry.upgrade()?;
        (entry.recency() == self.tick && entry.is_resident()).then_some(entry)
    }
}

/// Per-region LRU eviction controller.
pub struct LruController {
    measure: EvictionLimit,
    limit: AtomicUsize,
    action: EvictionAction,
    batch_size: usize,
    /// Entry class overhead, for byte accounting.
    overhead: usize,

    clock: AtomicU64,
    pending: Injector<LruRecord>,
    queue: Mutex<VecDeque<LruRecord>>,
    /// Held for the duration of a pass.
    pass: Mutex<()>,
    evicting: AtomicBool,
    /// Passes run on an `EvictionWorker` instead of the writing thread.
    background: AtomicBool,

    // Signed: footprint changes are accounted after the entry lock is released
    // and may land out of order.
    resident_entries: AtomicI64,
    resident_bytes: AtomicI64,
}

impl LruController {
    pub fn new(config: &EvictionConfig, overhead: usize) -> Self {
        Self {
            measure: config.limit,
            limit: AtomicUsize::new(config.limit.value()),
            action: config.action,
            batch_size: config.batch_size.max(1),
            overhead,
            clock: AtomicU64::new(0),
            pending: Injector::new(),
            queue: Mutex::new(VecDeque::new()),
            pass: Mutex::new(()),
            evicting: AtomicBool::new(false),
            background: AtomicBool::new(false),
            resident_entries: AtomicI64::new(0),
            resident_bytes: AtomicI64::new(0),
        }
    }

    pub fn action(&self) -> EvictionAction {
        self.action
    }

    /// Current limit, in the configured measure.
    pub fn limit(&self) -> EvictionLimit {
        self.measure.with_value(self.limit.load(Ordering::Relaxed))
    }

    /// Adjust the limit of a live region.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
        log::info!("Eviction limit set to {:?}", self.limit());
    }

    pub fn set_background(&self, enabled: bool) {
        self.background.store(enabled, Ordering::Relaxed);
    }

    pub fn evicting_in_background(&self) -> bool {
        self.background.load(Ordering::Relaxed)
    }

    /// Record an access. Lock-free unless the injector is due for a drain.
    pub fn touch(&self, entry: &Arc<RegionEntry>) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.touch(tick);
        self.pending.push(LruRecord {
            entry: Arc::downgrade(entry),
            tick,
        });
        if self.pending.len() > COMPACT_SLACK {
            // A running pass holds the queue and drains the injector itself.
            if let Some(mut queue) = self.queue.try_lock() {
                self.drain_pending(&mut queue);
                self.compact(&mut queue);
            }
        }
    }

    /// Recency records held for the evictor, pending and queued.
    pub fn tracked_records(&self) -> usize {
        self.pending.len() + self.queue.lock().len()
    }

    /// Apply an entry's footprint change to the region totals.
    pub fn account(&self, change: FootprintChange) {
        if change.is_noop() {
            return;
        }
        let entries = change.after.entries as i64 - change.before.entries as i64;
        let bytes = change.after.bytes as i64 - change.before.bytes as i64;
        self.resident_entries.fetch_add(entries, Ordering::Relaxed);
        self.resident_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn resident_entries(&self) -> usize {
        self.resident_entries.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes.load(Ordering::Relaxed).max(0) as usize
    }

    /// Tracked footprint in the configured measure.
    pub fn footprint(&self) -> usize {
        match self.measure {
            EvictionLimit::Entries(_) => self.resident_entries(),
            EvictionLimit::Bytes(_) => self.resident_bytes(),
        }
    }

    pub fn over_capacity(&self) -> bool {
        self.footprint() > self.limit.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> EvictionState {
        if self.evicting.load(Ordering::Relaxed) || self.over_capacity() {
            EvictionState::Evicting
        } else {
            EvictionState::UnderCapacity
        }
    }

    /// Reset totals and recency after the region is cleared.
    pub fn reset(&self) {
        let _pass = self.pass.lock();
        let mut queue = self.queue.lock();
        self.drain_pending(&mut queue);
        queue.clear();
        self.resident_entries.store(0, Ordering::Relaxed);
        self.resident_bytes.store(0, Ordering::Relaxed);
    }

    /// Run eviction until the region is under capacity, a write fails, or no
    /// resident victim is left. Returns `None` if another pass is running.
    pub(crate) fn evict(&self, host: &dyn EvictionHost) -> Option<EvictionReport> {
        let _pass = self.pass.try_lock()?;
        let mut report = EvictionReport::default();
        if !self.over_capacity() {
            return Some(report);
        }

        self.evicting.store(true, Ordering::Relaxed);
        while self.over_capacity() {
            let victims = self.select_victims();
            if victims.is_empty() {
                log::debug!(
                    "Over capacity ({} > {}) with no evictable entry",
                    self.footprint(),
                    self.limit.load(Ordering::Relaxed)
                );
                break;
            }
            let done = match self.action {
                EvictionAction::OverflowToDisk => self.fault_out(host, victims, &mut report),
                EvictionAction::LocalDestroy => {
                    self.destroy(host, victims, &mut report);
                    true
                }
            };
            if !done {
                break;
            }
        }
        self.evicting.store(false, Ordering::Relaxed);

        if report.evicted() > 0 {
            log::debug!(
                "Eviction pass: {} faulted out, {} destroyed, {} superseded, footprint now {}",
                report.faulted_out,
                report.destroyed,
                report.superseded,
                self.footprint()
            );
        }
        Some(report)
    }

    /// Pop least recently used resident entries until the projected footprint
    /// is within the limit or a batch is full.
    fn select_victims(&self) -> Vec<Arc<RegionEntry>> {
        let mut queue = self.queue.lock();
        self.drain_pending(&mut queue);
        self.compact(&mut queue);

        let limit = self.limit.load(Ordering::Relaxed);
        let mut projected = self.footprint();
        let mut victims = Vec::new();
        while projected > limit && victims.len() < self.batch_size {
            let Some(record) = queue.pop_front() else {
                break;
            };
            if let Some(entry) = record.candidate() {
                projected = projected.saturating_sub(self.measured(entry.footprint(self.overhead)));
                victims.push(entry);
            }
        }
        victims
    }

    fn fault_out(
        &self,
        host: &dyn EvictionHost,
        victims: Vec<Arc<RegionEntry>>,
        report: &mut EvictionReport,
    ) -> bool {
        let env = host.entry_env();
        let mut snapshots: Vec<(Arc<RegionEntry>, u64)> = Vec::with_capacity(victims.len());
        let mut records: Vec<(Key, Value)> = Vec::with_capacity(victims.len());
        for entry in victims {
            if let Some((value, generation)) = entry.begin_fault_out(env.store) {
                records.push((entry.key(), value));
                snapshots.push((entry, generation));
            }
        }
        if records.is_empty() {
            return true;
        }

        match env.store.write_overflow(&records) {
            Ok(tokens) => {
                for ((entry, generation), token) in snapshots.into_iter().zip(tokens) {
                    match entry.commit_fault_out(generation, token, &env) {
                        Some(change) => {
                            self.account(change);
                            report.faulted_out += 1;
                        }
                        None => report.superseded += 1,
                    }
                }
                true
            }
            Err(err) => {
                log::warn!(
                    "Fault-out of {} entries failed, keeping them resident: {}",
                    snapshots.len(),
                    err
                );
                self.requeue(snapshots.into_iter().map(|(entry, _)| entry));
                report.failure = Some(err);
                false
            }
        }
    }

    fn destroy(
        &self,
        host: &dyn EvictionHost,
        victims: Vec<Arc<RegionEntry>>,
        report: &mut EvictionReport,
    ) {
        let env = host.entry_env();
        for entry in victims {
            let Some((_, generation)) = entry.begin_fault_out(env.store) else {
                continue;
            };
            match entry.evict_destroy(generation, &env) {
                Some(change) => {
                    self.account(change);
                    host.unlink(&entry);
                    report.destroyed += 1;
                }
                None => report.superseded += 1,
            }
        }
    }

    /// Put victims back at the head of the queue, oldest first.
    fn requeue(&self, entries: impl DoubleEndedIterator<Item = Arc<RegionEntry>>) {
        let mut queue = self.queue.lock();
        for entry in entries.rev() {
            queue.push_front(LruRecord {
                tick: entry.recency(),
                entry: Arc::downgrade(&entry),
            });
        }
    }

    fn drain_pending(&self, queue: &mut VecDeque<LruRecord>) {
        loop {
            match self.pending.steal() {
                Steal::Success(record) => queue.push_back(record),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    fn compact(&self, queue: &mut VecDeque<LruRecord>) {
        let threshold = self.resident_entries() * 4 + COMPACT_SLACK;
        if queue.len() > threshold {
            let before = queue.len();
            queue.retain(|record| record.candidate().is_some());
            log::debug!("Compacted LRU queue from {} to {} records", before, queue.len());
        }
    }

    fn measured(&self, footprint: Footprint) -> usize {
        match self.measure {
            EvictionLimit::Entries(_) => footprint.entries,
            EvictionLimit::Bytes(_) => footprint.bytes,
        }
    }
}

enum Command {
    Evict,
    Flush(Sender<()>),
    Shutdown,
}

/// Dedicated thread that runs eviction passes off the calling threads.
pub struct EvictionWorker {
    commands: Sender<Command>,
    /// Set while an `Evict` command is queued, so bursts of writes coalesce.
    wake_pending: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionWorker {
    /// Start the worker. `pass` runs one eviction pass.
    pub fn spawn<F>(name: &str, pass: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (commands, rx) = crossbeam_channel::unbounded();
        let wake_pending = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&wake_pending);
        let handle = std::thread::Builder::new()
            .name(format!("{}-evictor", name))
            .spawn(move || Self::run(rx, flag, pass))?;

        log::debug!("Eviction worker started for region '{}'", name);
        Ok(Self {
            commands,
            wake_pending,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run<F: Fn()>(rx: Receiver<Command>, wake_pending: Arc<AtomicBool>, pass: F) {
        for command in rx {
            match command {
                Command::Evict => {
                    wake_pending.store(false, Ordering::Release);
                    pass();
                }
                Command::Flush(ack) => {
                    pass();
                    let _ = ack.send(());
                }
                Command::Shutdown => break,
            }
        }
    }

    /// A handle that stops the worker without joining it.
    pub fn stopper(&self) -> WorkerStop {
        WorkerStop {
            commands: self.commands.clone(),
        }
    }

    /// True once the worker thread has exited.
    pub fn is_stopped(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Ask for a pass. Returns immediately.
    pub fn request(&self) {
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Evict);
        }
    }

    /// Block until every previously requested pass, plus one more, has run.
    pub fn flush(&self) {
        let (ack, done) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Stop after the current pass and join the thread.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("Eviction worker panicked");
            }
        }
    }
}

/// Stops an `EvictionWorker` after its current pass. Safe to use from the
/// worker's own thread, where joining would deadlock.
#[derive(Clone)]
pub struct WorkerStop {
    commands: Sender<Command>,
}

impl WorkerStop {
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for EvictionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryTier, RegionConfig};
    use crate::engine::event::Operation;
    use crate::engine::factory::{EntryContext, EntryFactory};
    use crate::engine::overflow::{DiskStore, DiskToken, OverflowFile};
    use crate::engine::value::{StoredValue, ValueStore};
    use crate::engine::entry::Write;
    use crate::types::MemberId;
    use std::io;

    struct Host {
        store: ValueStore,
        unlinked: Mutex<Vec<Key>>,
    }

    impl EvictionHost for Host {
        fn entry_env(&self) -> EntryEnv<'_> {
            EntryEnv {
                store: &self.store,
                overhead: 0,
                member: MemberId(1),
                now_ms: 1,
            }
        }

        fn unlink(&self, entry: &Arc<RegionEntry>) {
            self.unlinked.lock().push(entry.key());
        }
    }

    struct BrokenDisk;

    impl DiskStore for BrokenDisk {
        fn write(&self, _key: &Key, _value: &[u8]) -> Result<DiskToken> {
            Err(GridError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn read(&self, _token: DiskToken) -> Result<Value> {
            Err(GridError::Io(io::Error::new(io::ErrorKind::Other, "unreadable")))
        }

        fn release(&self, _token: DiskToken) {}
    }

    fn setup(
        limit: usize,
        disk: Option<Arc<dyn DiskStore>>,
        action: EvictionAction,
    ) -> (Host, LruController, EntryFactory) {
        let eviction = EvictionConfig::overflow_entries(limit).with_action(action);
        let config = RegionConfig::default().with_eviction(eviction.clone());
        let host = Host {
            store: ValueStore::new(MemoryTier::Heap, disk, 1),
            unlinked: Mutex::new(Vec::new()),
        };
        let lru = LruController::new(&eviction, 0);
        (host, lru, EntryFactory::new(EntryContext::from_config(&config)))
    }

    fn insert(host: &Host, lru: &LruController, factory: &EntryFactory, key: i32) -> Arc<RegionEntry> {
        let entry = Arc::new(factory.create_entry(Key::Int(key), StoredValue::Absent));
        let value = Some(Value::from(format!("value-{}", key)));
        let write = entry.write_local(Operation::Update, value, false, &host.entry_env());
        if let Write::Done(m) = write.unwrap() {
            lru.account(m.change);
        }
        lru.touch(&entry);
        entry
    }

    fn disk() -> (tempfile::TempDir, Arc<dyn DiskStore>) {
        let dir = tempfile::tempdir().unwrap();
        let file = OverflowFile::open(dir.path().join("lru.overflow"), false).unwrap();
        (dir, Arc::new(file))
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let (_dir, disk) = disk();
        let (host, lru, factory) = setup(3, Some(disk), EvictionAction::OverflowToDisk);
        let entries: Vec<_> = (1..=4).map(|k| insert(&host, &lru, &factory, k)).collect();
        assert_eq!(lru.state(), EvictionState::Evicting);

        let report = lru.evict(&host).unwrap();
        assert_eq!(report.faulted_out, 1);
        assert!(!entries[0].is_resident());
        assert!(entries[1..].iter().all(|e| e.is_resident()));
        assert_eq!(lru.resident_entries(), 3);
        assert_eq!(lru.state(), EvictionState::UnderCapacity);
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let (_dir, disk) = disk();
        let (host, lru, factory) = setup(2, Some(disk), EvictionAction::OverflowToDisk);
        let first = insert(&host, &lru, &factory, 1);
        let second = insert(&host, &lru, &factory, 2);
        lru.touch(&first);
        let third = insert(&host, &lru, &factory, 3);

        lru.evict(&host).unwrap();
        assert!(first.is_resident());
        assert!(!second.is_resident());
        assert!(third.is_resident());
    }

    #[test]
    fn test_failed_fault_out_keeps_entries_resident() {
        let (host, lru, factory) = setup(1, Some(Arc::new(BrokenDisk)), EvictionAction::OverflowToDisk);
        let first = insert(&host, &lru, &factory, 1);
        insert(&host, &lru, &factory, 2);

        let report = lru.evict(&host).unwrap();
        assert!(report.failure.is_some());
        assert!(first.is_resident());
        assert_eq!(lru.resident_entries(), 2);

        // The victim was requeued, so the next pass picks it again.
        let again = lru.evict(&host).unwrap();
        assert!(again.failure.is_some());
    }

    #[test]
    fn test_local_destroy_unlinks_victims() {
        let (host, lru, factory) = setup(2, None, EvictionAction::LocalDestroy);
        let first = insert(&host, &lru, &factory, 1);
        insert(&host, &lru, &factory, 2);
        insert(&host, &lru, &factory, 3);

        let report = lru.evict(&host).unwrap();
        assert_eq!(report.destroyed, 1);
        assert!(first.is_detached());
        assert_eq!(host.unlinked.lock().as_slice(), &[Key::Int(1)]);
    }

    #[test]
    fn test_raised_limit_stops_eviction() {
        let (_dir, disk) = disk();
        let (host, lru, factory) = setup(1, Some(disk), EvictionAction::OverflowToDisk);
        insert(&host, &lru, &factory, 1);
        insert(&host, &lru, &factory, 2);
        lru.set_limit(10);
        assert_eq!(lru.limit(), EvictionLimit::Entries(10));
        assert_eq!(lru.evict(&host).unwrap().evicted(), 0);
    }

    #[test]
    fn test_worker_flush_runs_pass() {
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&passes);
        let worker = EvictionWorker::spawn("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        worker.request();
        worker.flush();
        assert!(passes.load(Ordering::SeqCst) >= 2);
        worker.shutdown();
        // Requests after shutdown are ignored.
        worker.request();
    }

    #[test]
    fn test_touches_stay_bounded_under_capacity() {
        let (_dir, disk) = disk();
        let (host, lru, factory) = setup(1_000, Some(disk), EvictionAction::OverflowToDisk);
        let entry = insert(&host, &lru, &factory, 1);
        for _ in 0..200_000 {
            lru.touch(&entry);
        }
        assert!(!lru.over_capacity());
        assert!(lru.tracked_records() < 3 * COMPACT_SLACK, "{}", lru.tracked_records());

        // The latest record survives compaction, so the entry is still evictable.
        lru.set_limit(1);
        let second = insert(&host, &lru, &factory, 2);
        lru.evict(&host).unwrap();
        assert!(!entry.is_resident());
        assert!(second.is_resident());
    }

    #[test]
    fn test_worker_stop_from_its_own_thread() {
        let stop: Arc<Mutex<Option<WorkerStop>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&stop);
        let worker = EvictionWorker::spawn("self-stop", move || {
            if let Some(stop) = inner.lock().as_ref() {
                stop.stop();
            }
        })
        .unwrap();
        *stop.lock() = Some(worker.stopper());
        worker.request();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !worker.is_stopped() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(worker.is_stopped());
        worker.shutdown();
    }
}
