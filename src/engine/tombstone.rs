//! GRIDCORE - Tombstone Expiry
//! Tombstones keep a destroyed key's version stamp so that late replicated
//! updates still resolve correctly. After the region's tombstone timeout
//! they are physically removed.
//!
//! ## Design
//! - Records are `(expires_at_ms, entry, generation)`, ordered by expiry in a
//!   `BTreeMap` so a sweep only walks what is due
//! - A record is honored only if the entry is still a tombstone at the same
//!   generation; a revived and re-destroyed entry has a newer record

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::entry::RegionEntry;

struct TombstoneRecord {
    entry: Weak<RegionEntry>,
    generation: u64,
}

/// Expiry schedule for a region's tombstones.
pub struct TombstoneIndex {
    timeout_ms: u64,
    /// `(expires_at_ms, sequence) -> record`
    schedule: Mutex<BTreeMap<(u64, u64), TombstoneRecord>>,
    sequence: AtomicU64,
}

impl TombstoneIndex {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            schedule: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Schedule `entry`, tombstoned at `generation`, for removal.
    pub fn register(&self, entry: &Arc<RegionEntry>, generation: u64, now_ms: u64) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.schedule.lock().insert(
            (now_ms + self.timeout_ms, seq),
            TombstoneRecord {
                entry: Arc::downgrade(entry),
                generation,
            },
        );
    }

    /// True if some record is due at `now_ms`.
    pub fn has_expired(&self, now_ms: u64) -> bool {
        self.schedule
            .lock()
            .keys()
            .next()
            .map_or(false, |&(expires_at, _)| expires_at <= now_ms)
    }

    /// Remove and return due records whose entry is still alive.
    pub fn take_expired(&self, now_ms: u64) -> Vec<(Arc<RegionEntry>, u64)> {
        let mut schedule = self.schedule.lock();
        let pending = schedule.split_off(&(now_ms + 1, 0));
        let due = std::mem::replace(&mut *schedule, pending);
        drop(schedule);

        due.into_values()
            .filter_map(|record| Some((record.entry.upgrade()?, record.generation)))
            .collect()
    }

    pub fn clear(&self) {
        self.schedule.lock().clear();
    }

    /// Number of scheduled records, including superseded ones.
    pub fn len(&self) -> usize {
        self.schedule.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::engine::factory::{EntryContext, EntryFactory};
    use crate::engine::value::StoredValue;
    use crate::types::Key;

    fn entry(key: i32) -> Arc<RegionEntry> {
        let factory = EntryFactory::new(EntryContext::from_config(&RegionConfig::default()));
        Arc::new(factory.create_entry(Key::Int(key), StoredValue::Absent))
    }

    #[test]
    fn test_only_due_records_are_taken() {
        let index = TombstoneIndex::new(Duration::from_millis(100));
        let early = entry(1);
        let late = entry(2);
        index.register(&early, 1, 1_000);
        index.register(&late, 1, 1_050);

        assert!(!index.has_expired(1_099));
        assert!(index.has_expired(1_100));

        let due = index.take_expired(1_100);
        assert_eq!(due.len(), 1);
        assert!(Arc::ptr_eq(&due[0].0, &early));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_dropped_entries_are_skipped() {
        let index = TombstoneIndex::new(Duration::ZERO);
        let gone = entry(1);
        index.register(&gone, 3, 10);
        drop(gone);
        assert!(index.take_expired(10).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_same_expiry_does_not_collide() {
        let index = TombstoneIndex::new(Duration::from_millis(5));
        let a = entry(1);
        let b = entry(2);
        index.register(&a, 1, 0);
        index.register(&b, 1, 0);
        assert_eq!(index.take_expired(5).len(), 2);
    }
}
