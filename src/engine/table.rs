//! GRIDCORE - Region Entry Table
//! The in-memory map from key to entry for one region.
//!
//! Entries are stored under a 64-bit key hash that is identical for the
//! inline and the reference-held form of a key. Each hash slot holds a small
//! collision bucket; lookups verify the query key against each entry's stored
//! key without rebuilding it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::types::Key;

use super::entry::RegionEntry;

enum Bucket {
    One(Arc<RegionEntry>),
    Many(Vec<Arc<RegionEntry>>),
}

impl Bucket {
    fn find(&self, key: &Key) -> Option<&Arc<RegionEntry>> {
        match self {
            Bucket::One(entry) => entry.matches(key).then_some(entry),
            Bucket::Many(entries) => entries.iter().find(|e| e.matches(key)),
        }
    }

    fn push(&mut self, entry: Arc<RegionEntry>) {
        match self {
            Bucket::One(existing) => {
                *self = Bucket::Many(vec![Arc::clone(existing), entry]);
            }
            Bucket::Many(entries) => entries.push(entry),
        }
    }

    /// Remove `target` by identity. Returns `(removed, bucket_now_empty)`.
    fn remove(&mut self, target: &Arc<RegionEntry>) -> (bool, bool) {
        match self {
            Bucket::One(entry) => {
                let hit = Arc::ptr_eq(entry, target);
                (hit, hit)
            }
            Bucket::Many(entries) => {
                let before = entries.len();
                entries.retain(|e| !Arc::ptr_eq(e, target));
                let removed = entries.len() != before;
                if entries.len() == 1 {
                    let last = entries.remove(0);
                    *self = Bucket::One(last);
                }
                (removed, false)
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<RegionEntry>> {
        let slice = match self {
            Bucket::One(entry) => std::slice::from_ref(entry),
            Bucket::Many(entries) => entries.as_slice(),
        };
        slice.iter()
    }
}

/// Concurrent hash table of region entries.
pub struct EntryTable {
    map: DashMap<u64, Bucket>,
    count: AtomicUsize,
}

impl EntryTable {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &Key) -> Option<Arc<RegionEntry>> {
        self.map
            .get(&key.hash64())
            .and_then(|bucket| bucket.find(key).cloned())
    }

    /// The entry for `key`, creating it with `make` if there is none.
    /// Returns the entry and whether it was created by this call.
    pub fn get_or_insert_with<F>(&self, key: &Key, make: F) -> (Arc<RegionEntry>, bool)
    where
        F: FnOnce() -> RegionEntry,
    {
        match self.map.entry(key.hash64()) {
            Entry::Occupied(mut slot) => {
                if let Some(existing) = slot.get().find(key) {
                    return (Arc::clone(existing), false);
                }
                let entry = Arc::new(make());
                slot.get_mut().push(Arc::clone(&entry));
                self.count.fetch_add(1, Ordering::Relaxed);
                (entry, true)
            }
            Entry::Vacant(slot) => {
                let entry = Arc::new(make());
                slot.insert(Bucket::One(Arc::clone(&entry)));
                self.count.fetch_add(1, Ordering::Relaxed);
                (entry, true)
            }
        }
    }

    /// Remove exactly this entry. A newer entry for the same key is left alone.
    pub fn remove(&self, entry: &Arc<RegionEntry>) -> bool {
        let hash = entry.inline_key().hash64();
        let mut removed = false;
        self.map.remove_if_mut(&hash, |_, bucket| {
            let (hit, empty) = bucket.remove(entry);
            removed = hit;
            empty
        });
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot of every entry, including invalid entries and tombstones.
    pub fn entries(&self) -> Vec<Arc<RegionEntry>> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.map.iter() {
            out.extend(bucket.value().iter().cloned());
        }
        out
    }

    /// Remove every entry and return them.
    pub fn drain(&self) -> Vec<Arc<RegionEntry>> {
        let entries = self.entries();
        for entry in &entries {
            self.remove(entry);
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::new()
    }
}
