//! GRIDCORE - Region Entry
//! The unit of storage: key, value, LRU recency, optional statistics,
//! optional version stamp and lifecycle state.
//!
//! Value, stamp and lifecycle live behind one per-entry mutex and change
//! together, so a reader never sees a value paired with another write's stamp.
//! Recency is a lock-free tick outside that critical section.
//!
//! ## Generations
//! Every logical value change bumps the entry generation. Fault-out snapshots
//! the generation, writes to disk without the lock, and commits only if the
//! generation is unchanged. A concurrent update therefore always wins over a
//! stale fault-out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{GridError, Result};
use crate::types::{Key, MemberId, Value};

use super::event::Operation;
use super::factory::EntryVariant;
use super::inline_key::InlineKey;
use super::overflow::DiskToken;
use super::value::{StoredValue, ValueStore};
use super::version::{resolve, UpdateOutcome, VersionStamp};

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Holds a value (resident or overflowed).
    Valid,
    /// Value dropped; key and stamp kept.
    Invalid,
    /// Logically removed; kept for conflict resolution until it expires.
    Tombstone,
    /// Awaiting confirmation during a full region resynchronization.
    Recovering,
}

impl Lifecycle {
    /// True if the entry carries a value.
    pub fn is_live(&self) -> bool {
        matches!(self, Lifecycle::Valid | Lifecycle::Recovering)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Valid => "valid",
            Lifecycle::Invalid => "invalid",
            Lifecycle::Tombstone => "tombstone",
            Lifecycle::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Per-entry hit/miss counts and access times (the "Stats" capability).
#[derive(Debug, Default)]
pub struct AccessStats {
    hits: AtomicU64,
    misses: AtomicU64,
    last_accessed: AtomicU64,
    last_modified: AtomicU64,
}

impl AccessStats {
    fn record_read(&self, hit: bool, now_ms: u64) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.last_accessed.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn record_modified(&self, now_ms: u64) {
        self.last_modified.fetch_max(now_ms, Ordering::Relaxed);
        self.last_accessed.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::Relaxed)
    }
}

/// What an entry counts against the eviction limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    /// 1 if a value is resident, else 0.
    pub entries: usize,
    /// Entry class overhead plus resident value length.
    pub bytes: usize,
}

/// Footprint before and after a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FootprintChange {
    pub before: Footprint,
    pub after: Footprint,
}

impl FootprintChange {
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Region-wide inputs to an entry mutation.
pub struct EntryEnv<'a> {
    pub store: &'a ValueStore,
    /// Estimated fixed bytes of the region's entry class.
    pub overhead: usize,
    /// Member stamped on local writes.
    pub member: MemberId,
    pub now_ms: u64,
}

/// Result of a mutation that reached the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub outcome: UpdateOutcome,
    /// Stamp held by the entry after the mutation.
    pub stamp: Option<VersionStamp>,
    pub lifecycle: Lifecycle,
    pub generation: u64,
    pub change: FootprintChange,
}

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    /// The entry was removed from its region; look the key up again.
    Detached,
    /// A precondition did not hold (key present for create, absent for destroy).
    Skipped,
    Done(Mutation),
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub value: Option<Value>,
    pub faulted_in: bool,
    pub change: FootprintChange,
}

/// A consistent copy of an entry's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: Key,
    /// The value if resident; `None` for overflowed, invalid or tombstoned entries.
    pub value: Option<Value>,
    pub stamp: Option<VersionStamp>,
    pub lifecycle: Lifecycle,
    pub resident: bool,
    pub variant: EntryVariant,
}

struct EntryState {
    value: StoredValue,
    stamp: Option<VersionStamp>,
    lifecycle: Lifecycle,
    generation: u64,
    /// Removed from the region table; no further mutation lands here.
    detached: bool,
}

impl EntryState {
    fn footprint(&self, overhead: usize) -> Footprint {
        if self.lifecycle.is_live() && self.value.is_resident() {
            Footprint {
                entries: 1,
                bytes: overhead + self.value.resident_len(),
            }
        } else {
            Footprint::default()
        }
    }

    /// Install a logically new value, releasing the old one.
    fn install(&mut self, value: StoredValue, lifecycle: Lifecycle, store: &ValueStore) {
        let old = std::mem::replace(&mut self.value, value);
        store.release(old);
        self.lifecycle = lifecycle;
        self.generation += 1;
    }
}

/// One key/value record of a region.
pub struct RegionEntry {
    key: InlineKey,
    variant: EntryVariant,
    /// LRU tick of the last touch.
    recency: AtomicU64,
    stats: Option<Box<AccessStats>>,
    state: Mutex<EntryState>,
}

impl RegionEntry {
    pub(crate) fn new(
        key: InlineKey,
        variant: EntryVariant,
        value: StoredValue,
        stamp: Option<VersionStamp>,
    ) -> Self {
        let lifecycle = match value {
            StoredValue::Absent => Lifecycle::Tombstone,
            _ => Lifecycle::Valid,
        };
        Self {
            key,
            stats: variant.statistics.then(Box::<AccessStats>::default),
            variant,
            recency: AtomicU64::new(0),
            state: Mutex::new(EntryState {
                value,
                stamp,
                lifecycle,
                generation: 0,
                detached: false,
            }),
        }
    }

    /// The key, rebuilt from its inline form if needed.
    pub fn key(&self) -> Key {
        self.key.to_key()
    }

    pub fn inline_key(&self) -> &InlineKey {
        &self.key
    }

    /// Representation-independent key equality.
    pub fn matches(&self, key: &Key) -> bool {
        self.key.matches(key)
    }

    pub fn variant(&self) -> EntryVariant {
        self.variant
    }

    pub fn recency(&self) -> u64 {
        self.recency.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.recency.store(tick, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Option<&AccessStats> {
        self.stats.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn stamp(&self) -> Option<VersionStamp> {
        self.state.lock().stamp
    }

    /// True if a live value is held in memory.
    pub fn is_resident(&self) -> bool {
        let state = self.state.lock();
        state.lifecycle.is_live() && state.value.is_resident()
    }

    /// True if the value lives in the overflow tier.
    pub fn is_overflowed(&self) -> bool {
        self.state.lock().value.is_overflowed()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn footprint(&self, overhead: usize) -> Footprint {
        self.state.lock().footprint(overhead)
    }

    pub fn snapshot(&self, store: &ValueStore) -> Result<EntrySnapshot> {
        let state = self.state.lock();
        let value = if state.lifecycle.is_live() {
            store.resident(&state.value)?
        } else {
            None
        };
        Ok(EntrySnapshot {
            key: self.key(),
            value,
            stamp: state.stamp,
            lifecycle: state.lifecycle,
            resident: state.lifecycle.is_live() && state.value.is_resident(),
            variant: self.variant,
        })
    }

    /// Read the value, faulting it in from the overflow tier if needed.
    ///
    /// Blocks this entry (not the region) for the duration of the disk read.
    /// A failed fault-in leaves the entry overflowed and returns `FaultIn`.
    pub fn read(&self, env: &EntryEnv<'_>) -> Result<ReadOutcome> {
        let mut state = self.state.lock();
        if state.detached || !state.lifecycle.is_live() {
            drop(state);
            self.record_read(false, env.now_ms);
            return Ok(ReadOutcome {
                value: None,
                faulted_in: false,
                change: FootprintChange::default(),
            });
        }

        let overflowed = match state.value {
            StoredValue::Overflowed(token) => Some(token),
            _ => None,
        };
        let outcome = match overflowed {
            Some(token) => {
                let before = state.footprint(env.overhead);
                let value = env
                    .store
                    .read_overflow(token)
                    .map_err(|source| GridError::FaultIn {
                        key: self.key().to_string(),
                        source: Box::new(source),
                    })?;
                // Same logical value, so the generation stays.
                let old = std::mem::replace(&mut state.value, env.store.store(value.clone()));
                env.store.release(old);
                ReadOutcome {
                    value: Some(value),
                    faulted_in: true,
                    change: FootprintChange {
                        before,
                        after: state.footprint(env.overhead),
                    },
                }
            }
            None => ReadOutcome {
                value: env.store.resident(&state.value)?,
                faulted_in: false,
                change: FootprintChange::default(),
            },
        };
        drop(state);
        self.record_read(outcome.value.is_some(), env.now_ms);
        Ok(outcome)
    }

    /// Apply a local write, bumping the stamp to `(v + 1, now, local member)`.
    ///
    /// `only_if_absent` turns an update into a create: it is skipped when the
    /// entry is valid or invalid. Invalidate and destroy are skipped when there
    /// is nothing to drop. Fails with `VersionExhausted`, leaving the entry
    /// untouched, when the version counter cannot advance.
    pub fn write_local(
        &self,
        operation: Operation,
        value: Option<Value>,
        only_if_absent: bool,
        env: &EntryEnv<'_>,
    ) -> Result<Write> {
        let mut state = self.state.lock();
        if state.detached {
            return Ok(Write::Detached);
        }
        let skip = match operation {
            Operation::Update => only_if_absent && state.lifecycle != Lifecycle::Tombstone,
            Operation::Invalidate => !state.lifecycle.is_live(),
            Operation::Destroy => state.lifecycle == Lifecycle::Tombstone,
        };
        if skip {
            return Ok(Write::Skipped);
        }

        let before = state.footprint(env.overhead);
        if self.variant.versioned {
            let current = state.stamp.unwrap_or(VersionStamp::INITIAL);
            let next = current
                .next_local(env.member, env.now_ms)
                .ok_or_else(|| GridError::VersionExhausted(self.key().to_string()))?;
            state.stamp = Some(next);
        }
        Self::apply(&mut state, operation, value, env.store);
        let mutation = Mutation {
            outcome: UpdateOutcome::Applied,
            stamp: state.stamp,
            lifecycle: state.lifecycle,
            generation: state.generation,
            change: FootprintChange {
                before,
                after: state.footprint(env.overhead),
            },
        };
        drop(state);
        self.record_modified(env.now_ms);
        Ok(Write::Done(mutation))
    }

    /// Resolve a replicated update against this entry and apply it if it wins.
    ///
    /// Resolution and installation happen in one critical section, so a
    /// concurrent local write cannot slip between them. Works the same whether
    /// the value is resident or overflowed: the stamp never leaves memory.
    pub fn observe_update(
        &self,
        incoming: VersionStamp,
        operation: Operation,
        value: Option<Value>,
        env: &EntryEnv<'_>,
    ) -> Write {
        let mut state = self.state.lock();
        if state.detached {
            return Write::Detached;
        }
        let outcome = if self.variant.versioned {
            resolve(&state.stamp.unwrap_or(VersionStamp::INITIAL), &incoming)
        } else {
            UpdateOutcome::Applied
        };

        let before = state.footprint(env.overhead);
        if outcome.is_applied() {
            if self.variant.versioned {
                state.stamp = Some(incoming);
            }
            Self::apply(&mut state, operation, value, env.store);
        }
        let mutation = Mutation {
            outcome,
            stamp: state.stamp,
            lifecycle: state.lifecycle,
            generation: state.generation,
            change: FootprintChange {
                before,
                after: state.footprint(env.overhead),
            },
        };
        drop(state);
        if outcome.is_applied() {
            self.record_modified(env.now_ms);
        }
        Write::Done(mutation)
    }

    /// Install an authoritative resync value and stamp without conflict checks.
    pub fn install_resync(
        &self,
        stamp: VersionStamp,
        value: Option<Value>,
        env: &EntryEnv<'_>,
    ) -> Write {
        let mut state = self.state.lock();
        if state.detached {
            return Write::Detached;
        }
        let before = state.footprint(env.overhead);
        if self.variant.versioned {
            state.stamp = Some(stamp);
        }
        let operation = if value.is_some() {
            Operation::Update
        } else {
            Operation::Destroy
        };
        Self::apply(&mut state, operation, value, env.store);
        let mutation = Mutation {
            outcome: UpdateOutcome::Applied,
            stamp: state.stamp,
            lifecycle: state.lifecycle,
            generation: state.generation,
            change: FootprintChange {
                before,
                after: state.footprint(env.overhead),
            },
        };
        drop(state);
        self.record_modified(env.now_ms);
        Write::Done(mutation)
    }

    /// Mark a valid entry as awaiting resync confirmation.
    pub fn mark_recovering(&self) -> bool {
        let mut state = self.state.lock();
        if state.detached || state.lifecycle != Lifecycle::Valid {
            return false;
        }
        state.lifecycle = Lifecycle::Recovering;
        true
    }

    /// Tombstone an entry the resync snapshot did not confirm.
    pub fn finish_recovering(&self, env: &EntryEnv<'_>) -> Option<Mutation> {
        let mut state = self.state.lock();
        if state.detached || state.lifecycle != Lifecycle::Recovering {
            return None;
        }
        let before = state.footprint(env.overhead);
        state.install(StoredValue::Absent, Lifecycle::Tombstone, env.store);
        Some(Mutation {
            outcome: UpdateOutcome::Applied,
            stamp: state.stamp,
            lifecycle: state.lifecycle,
            generation: state.generation,
            change: FootprintChange {
                before,
                after: state.footprint(env.overhead),
            },
        })
    }

    /// First half of fault-out: the resident value and its generation.
    pub fn begin_fault_out(&self, store: &ValueStore) -> Option<(Value, u64)> {
        let state = self.state.lock();
        if state.detached || !state.lifecycle.is_live() || !state.value.is_resident() {
            return None;
        }
        let value = store.resident(&state.value).ok().flatten()?;
        Some((value, state.generation))
    }

    /// Second half of fault-out. Commits `token` only if the entry still holds
    /// the value that was written; otherwise the token is released and the
    /// entry keeps its newer state.
    pub fn commit_fault_out(
        &self,
        generation: u64,
        token: DiskToken,
        env: &EntryEnv<'_>,
    ) -> Option<FootprintChange> {
        let mut state = self.state.lock();
        let current = !state.detached
            && state.generation == generation
            && state.lifecycle.is_live()
            && state.value.is_resident();
        if !current {
            drop(state);
            env.store.release(StoredValue::Overflowed(token));
            return None;
        }
        let before = state.footprint(env.overhead);
        let old = std::mem::replace(&mut state.value, StoredValue::Overflowed(token));
        env.store.release(old);
        Some(FootprintChange {
            before,
            after: state.footprint(env.overhead),
        })
    }

    /// Local-destroy eviction: detach the entry if it still holds `generation`.
    pub fn evict_destroy(&self, generation: u64, env: &EntryEnv<'_>) -> Option<FootprintChange> {
        let mut state = self.state.lock();
        let current = !state.detached
            && state.generation == generation
            && state.lifecycle.is_live()
            && state.value.is_resident();
        if !current {
            return None;
        }
        Some(Self::detach_locked(&mut state, env))
    }

    /// Detach an expired tombstone that has not been revived since `generation`.
    pub fn expire_tombstone(&self, generation: u64, env: &EntryEnv<'_>) -> bool {
        let mut state = self.state.lock();
        if state.detached
            || state.generation != generation
            || state.lifecycle != Lifecycle::Tombstone
        {
            return false;
        }
        Self::detach_locked(&mut state, env);
        true
    }

    /// Unconditionally detach the entry and release its value.
    pub fn detach(&self, env: &EntryEnv<'_>) -> FootprintChange {
        let mut state = self.state.lock();
        if state.detached {
            return FootprintChange::default();
        }
        Self::detach_locked(&mut state, env)
    }

    fn detach_locked(state: &mut EntryState, env: &EntryEnv<'_>) -> FootprintChange {
        let before = state.footprint(env.overhead);
        state.install(StoredValue::Absent, Lifecycle::Tombstone, env.store);
        state.detached = true;
        FootprintChange {
            before,
            after: Footprint::default(),
        }
    }

    fn apply(state: &mut EntryState, operation: Operation, value: Option<Value>, store: &ValueStore) {
        match (operation, value) {
            (Operation::Update, Some(value)) => {
                state.install(store.store(value), Lifecycle::Valid, store)
            }
            // An update without a value carries no data; keep the entry as invalid.
            (Operation::Update, None) | (Operation::Invalidate, _) => {
                state.install(StoredValue::Absent, Lifecycle::Invalid, store)
            }
            (Operation::Destroy, _) => {
                state.install(StoredValue::Absent, Lifecycle::Tombstone, store)
            }
        }
    }

    fn record_read(&self, hit: bool, now_ms: u64) {
        if let Some(stats) = &self.stats {
            stats.record_read(hit, now_ms);
        }
    }

    fn record_modified(&self, now_ms: u64) {
        if let Some(stats) = &self.stats {
            stats.record_modified(now_ms);
        }
    }
}

impl fmt::Debug for RegionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegionEntry")
            .field("key", &self.key)
            .field("variant", &self.variant.name())
            .field("lifecycle", &state.lifecycle)
            .field("stamp", &state.stamp)
            .field("resident", &state.value.is_resident())
            .field("generation", &state.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionConfig, MemoryTier, RegionConfig};
    use crate::engine::factory::{EntryContext, EntryFactory};
    use crate::engine::overflow::{DiskStore, OverflowFile};
    use crate::engine::version::RejectReason;
    use std::sync::Arc;

    const LOCAL: MemberId = MemberId(1);

    fn factory(config: RegionConfig) -> EntryFactory {
        EntryFactory::new(EntryContext::from_config(&config))
    }

    fn env(store: &ValueStore) -> EntryEnv<'_> {
        EntryEnv {
            store,
            overhead: 100,
            member: LOCAL,
            now_ms: 1_000,
        }
    }

    fn put(entry: &RegionEntry, value: &'static [u8], store: &ValueStore) -> Mutation {
        let value = Some(Value::from_static(value));
        match entry.write_local(Operation::Update, value, false, &env(store)).unwrap() {
            Write::Done(m) => m,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn observe(
        entry: &RegionEntry,
        stamp: VersionStamp,
        value: &'static [u8],
        store: &ValueStore,
    ) -> UpdateOutcome {
        match entry.observe_update(stamp, Operation::Update, Some(Value::from_static(value)), &env(store)) {
            Write::Done(m) => m.outcome,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn read(entry: &RegionEntry, store: &ValueStore) -> Option<Value> {
        entry.read(&env(store)).unwrap().value
    }

    #[test]
    fn test_local_write_bumps_stamp_and_footprint() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);

        let first = put(&entry, b"abc", &store);
        assert_eq!(first.stamp, Some(VersionStamp::new(LOCAL, 1, 1_000)));
        assert_eq!(first.change.before, Footprint::default());
        assert_eq!(first.change.after, Footprint { entries: 1, bytes: 103 });

        let second = put(&entry, b"abcdef", &store);
        assert_eq!(second.stamp.unwrap().version, 2);
        assert_eq!(second.change.after.bytes, 106);
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"abcdef")));
    }

    #[test]
    fn test_stale_update_leaves_entry_unchanged() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        let current = VersionStamp::new(MemberId(7), 5, 500);
        assert_eq!(observe(&entry, current, b"five", &store), UpdateOutcome::Applied);

        let stale = VersionStamp::new(MemberId(9), 4, 9_999);
        assert_eq!(
            observe(&entry, stale, b"four", &store),
            UpdateOutcome::Rejected(RejectReason::Stale)
        );
        assert_eq!(entry.stamp(), Some(current));
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"five")));
    }

    #[test]
    fn test_conflict_winner_independent_of_arrival_order() {
        let a = VersionStamp::new(MemberId(10), 5, 2_000);
        let b = VersionStamp::new(MemberId(20), 5, 2_000);
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let f = factory(RegionConfig::default());

        let first = f.create_entry(Key::from("k"), StoredValue::Absent);
        observe(&first, a, b"from-a", &store);
        observe(&first, b, b"from-b", &store);

        let second = f.create_entry(Key::from("k"), StoredValue::Absent);
        observe(&second, b, b"from-b", &store);
        assert_eq!(
            observe(&second, a, b"from-a", &store),
            UpdateOutcome::Rejected(RejectReason::ConflictLoser)
        );

        assert_eq!(first.stamp(), second.stamp());
        assert_eq!(read(&first, &store), read(&second, &store));
        assert_eq!(read(&first, &store), Some(Value::from_static(b"from-b")));
    }

    #[test]
    fn test_unversioned_applies_every_update() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default().with_versioning(false))
            .create_entry(Key::Int(1), StoredValue::Absent);
        let stamp = VersionStamp::new(MemberId(2), 1, 1);
        assert_eq!(observe(&entry, stamp, b"x", &store), UpdateOutcome::Applied);
        assert_eq!(observe(&entry, stamp, b"y", &store), UpdateOutcome::Applied);
        assert_eq!(entry.stamp(), None);
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"y")));
    }

    #[test]
    fn test_invalidate_and_destroy_keep_stamp() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"v", &store);

        let e = env(&store);
        let invalidated = entry.write_local(Operation::Invalidate, None, false, &e).unwrap();
        assert!(matches!(invalidated, Write::Done(m) if m.lifecycle == Lifecycle::Invalid));
        assert_eq!(read(&entry, &store), None);
        assert_eq!(entry.stamp().unwrap().version, 2);

        // Nothing left to invalidate.
        let again = entry.write_local(Operation::Invalidate, None, false, &e).unwrap();
        assert_eq!(again, Write::Skipped);

        let destroyed = entry.write_local(Operation::Destroy, None, false, &e).unwrap();
        assert!(matches!(destroyed, Write::Done(m) if m.lifecycle == Lifecycle::Tombstone));
        assert_eq!(entry.stamp().unwrap().version, 3);
        let again = entry.write_local(Operation::Destroy, None, false, &e).unwrap();
        assert_eq!(again, Write::Skipped);
    }

    #[test]
    fn test_create_only_if_absent() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        let e = env(&store);
        let value = Some(Value::from_static(b"first"));
        assert!(matches!(
            entry.write_local(Operation::Update, value.clone(), true, &e).unwrap(),
            Write::Done(_)
        ));
        let again = entry.write_local(Operation::Update, value, true, &e).unwrap();
        assert_eq!(again, Write::Skipped);
    }

    #[test]
    fn test_fault_out_and_fault_in() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn DiskStore> =
            Arc::new(OverflowFile::open(dir.path().join("e.overflow"), false).unwrap());
        let store = ValueStore::new(MemoryTier::Heap, Some(disk), 1);
        let config = RegionConfig::default().with_eviction(EvictionConfig::overflow_entries(1));
        let entry = factory(config).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"payload", &store);
        let stamp = entry.stamp();

        let (value, generation) = entry.begin_fault_out(&store).unwrap();
        let token = store.write_overflow(&[(entry.key(), value)]).unwrap()[0];
        let change = entry.commit_fault_out(generation, token, &env(&store)).unwrap();
        assert_eq!(change.after, Footprint::default());
        assert!(!entry.is_resident());
        assert_eq!(entry.stamp(), stamp);

        let outcome = entry.read(&env(&store)).unwrap();
        assert!(outcome.faulted_in);
        assert_eq!(outcome.value, Some(Value::from_static(b"payload")));
        assert!(entry.is_resident());
        assert_eq!(entry.generation(), generation);
    }

    #[test]
    fn test_update_wins_over_stale_fault_out() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn DiskStore> =
            Arc::new(OverflowFile::open(dir.path().join("e.overflow"), false).unwrap());
        let store = ValueStore::new(MemoryTier::Heap, Some(disk), 1);
        let config = RegionConfig::default().with_eviction(EvictionConfig::overflow_entries(1));
        let entry = factory(config).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"old", &store);

        let (value, generation) = entry.begin_fault_out(&store).unwrap();
        put(&entry, b"new", &store);
        let token = store.write_overflow(&[(entry.key(), value)]).unwrap()[0];

        assert!(entry.commit_fault_out(generation, token, &env(&store)).is_none());
        assert!(entry.is_resident());
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"new")));
    }

    #[test]
    fn test_fault_in_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn DiskStore> =
            Arc::new(OverflowFile::open(dir.path().join("e.overflow"), false).unwrap());
        let store = ValueStore::new(MemoryTier::Heap, Some(disk), 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(9), StoredValue::Absent);
        put(&entry, b"v", &store);
        let (_, generation) = entry.begin_fault_out(&store).unwrap();
        // Token pointing past the end of the file.
        let bogus = DiskToken::new(1 << 20, 32);
        entry.commit_fault_out(generation, bogus, &env(&store)).unwrap();

        let err = entry.read(&env(&store)).unwrap_err();
        assert!(matches!(err, GridError::FaultIn { .. }));
        assert!(entry.is_overflowed());
        assert_eq!(entry.lifecycle(), Lifecycle::Valid);
    }

    #[test]
    fn test_detached_entry_rejects_writes() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"v", &store);
        let change = entry.detach(&env(&store));
        assert_eq!(change.before.entries, 1);
        assert_eq!(
            entry
                .write_local(Operation::Update, Some(Value::from_static(b"x")), false, &env(&store))
                .unwrap(),
            Write::Detached
        );
        assert_eq!(read(&entry, &store), None);
    }

    #[test]
    fn test_tombstone_expiry_respects_generation() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"v", &store);
        let e = env(&store);
        let generation = match entry.write_local(Operation::Destroy, None, false, &e).unwrap() {
            Write::Done(m) => m.generation,
            other => panic!("unexpected {:?}", other),
        };
        put(&entry, b"revived", &store);
        assert!(!entry.expire_tombstone(generation, &e));
        assert!(!entry.is_detached());
    }

    #[test]
    fn test_recovering_lifecycle() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        put(&entry, b"v", &store);
        assert!(entry.mark_recovering());
        assert_eq!(entry.lifecycle(), Lifecycle::Recovering);
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"v")));

        let m = entry.finish_recovering(&env(&store)).unwrap();
        assert_eq!(m.lifecycle, Lifecycle::Tombstone);
        assert_eq!(read(&entry, &store), None);
    }

    #[test]
    fn test_resync_may_move_version_backwards() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        observe(&entry, VersionStamp::new(MemberId(2), 9, 10), b"nine", &store);
        let older = VersionStamp::new(MemberId(3), 2, 5);
        entry.install_resync(older, Some(Value::from_static(b"two")), &env(&store));
        assert_eq!(entry.stamp(), Some(older));
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"two")));
    }

    #[test]
    fn test_statistics_capability() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default().with_statistics(true))
            .create_entry(Key::Int(1), StoredValue::Absent);
        read(&entry, &store);
        put(&entry, b"v", &store);
        read(&entry, &store);
        let stats = entry.stats().unwrap();
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.last_modified(), 1_000);
    }

    #[test]
    fn test_value_and_stamp_change_together() {
        let store = Arc::new(ValueStore::new(MemoryTier::Heap, None, 1));
        let entry = Arc::new(
            factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent),
        );

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let (entry, store) = (Arc::clone(&entry), Arc::clone(&store));
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        // Each writer stores the version it expects to receive.
                        let next = entry.stamp().map_or(1, |s| s.version + 1);
                        let e = env(&store);
                        let value = Some(Value::from(next.to_string()));
                        let write = entry.write_local(Operation::Update, value, false, &e);
                        if let Write::Done(m) = write.unwrap() {
                            assert!(m.stamp.is_some());
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            let snapshot = entry.snapshot(&store).unwrap();
            if let (Some(value), Some(stamp)) = (snapshot.value, snapshot.stamp) {
                // A value is always paired with a stamp at least as new as the
                // version its writer read before writing.
                let written: u64 = std::str::from_utf8(&value).unwrap().parse().unwrap();
                assert!(written <= stamp.version);
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(entry.stamp().unwrap().version, 2_000);
    }

    #[test]
    fn test_exhausted_version_rejects_local_write() {
        let store = ValueStore::new(MemoryTier::Heap, None, 1);
        let entry = factory(RegionConfig::default()).create_entry(Key::Int(1), StoredValue::Absent);
        let max = VersionStamp::new(MemberId(2), u64::MAX, 5);
        assert_eq!(observe(&entry, max, b"remote", &store), UpdateOutcome::Applied);

        let err = entry
            .write_local(Operation::Update, Some(Value::from_static(b"local")), false, &env(&store))
            .unwrap_err();
        assert!(matches!(err, GridError::VersionExhausted(_)));
        assert_eq!(entry.stamp(), Some(max));
        assert_eq!(read(&entry, &store), Some(Value::from_static(b"remote")));
    }
}
