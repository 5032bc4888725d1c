//! GRIDCORE - Region Entry Factory
//! Selects the entry representation for a key from the region's static
//! context and the key's runtime shape, then builds the entry.
//!
//! A representation is the tuple `(key shape, memory tier, versioned,
//! statistics, disk, LRU)`. The same tuple always yields the same variant.
//! Capacity accounting uses the region's *entry class*, which is the variant
//! with a reference-held key, so inlined and non-inlined keys are charged alike.

use std::fmt;

use crate::config::{InlineKeyPolicy, MemoryTier, RegionConfig};
use crate::types::Key;

use super::entry::{AccessStats, RegionEntry};
use super::inline_key::{classify, InlineKey, KeyShape};
use super::value::StoredValue;
use super::version::VersionStamp;

/// Static per-region inputs to representation selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryContext {
    pub tier: MemoryTier,
    pub versioned: bool,
    pub statistics: bool,
    pub lru: bool,
    pub disk: bool,
    pub inline_keys: InlineKeyPolicy,
}

impl EntryContext {
    pub fn from_config(config: &RegionConfig) -> Self {
        Self {
            tier: config.memory_tier,
            versioned: config.versioning,
            statistics: config.statistics,
            lru: config.eviction.is_some(),
            disk: config.overflows_to_disk(),
            inline_keys: config.inline_keys,
        }
    }
}

/// One concrete entry representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryVariant {
    pub key_shape: KeyShape,
    pub tier: MemoryTier,
    pub versioned: bool,
    pub statistics: bool,
    pub disk: bool,
    pub lru: bool,
}

impl EntryVariant {
    /// Representation name, e.g. `VersionedStatsDiskLRURegionEntryHeapIntKey`.
    pub fn name(&self) -> String {
        format!(
            "{}{}{}{}RegionEntry{}{}",
            if self.versioned { "Versioned" } else { "VM" },
            if self.statistics { "Stats" } else { "Thin" },
            if self.disk { "Disk" } else { "" },
            if self.lru { "LRU" } else { "" },
            match self.tier {
                MemoryTier::Heap => "Heap",
                MemoryTier::OffHeap => "OffHeap",
            },
            self.key_shape.suffix()
        )
    }
}

impl fmt::Display for EntryVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// The class every entry of a region is accounted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryClass(EntryVariant);

impl EntryClass {
    pub fn variant(&self) -> EntryVariant {
        self.0
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    /// Estimated fixed bytes per entry, excluding the value.
    pub fn estimated_overhead(&self) -> usize {
        let mut size = std::mem::size_of::<RegionEntry>() + std::mem::size_of::<Key>();
        if self.0.statistics {
            size += std::mem::size_of::<AccessStats>();
        }
        size
    }
}

/// Builds region entries for one region context.
pub struct EntryFactory {
    context: EntryContext,
    class: EntryClass,
}

impl EntryFactory {
    pub fn new(context: EntryContext) -> Self {
        let class = EntryClass(Self::variant_of(&context, KeyShape::Object));
        Self { context, class }
    }

    /// The same factory with versioning on. Returns an equal factory if it
    /// already was.
    pub fn make_versioned(&self) -> Self {
        Self::new(EntryContext {
            versioned: true,
            ..self.context
        })
    }

    /// The same factory storing values on the heap.
    pub fn make_on_heap(&self) -> Self {
        Self::new(EntryContext {
            tier: MemoryTier::Heap,
            ..self.context
        })
    }

    pub fn context(&self) -> &EntryContext {
        &self.context
    }

    /// Stable for the region regardless of which keys were inlined.
    pub fn entry_class(&self) -> EntryClass {
        self.class
    }

    /// The variant a key would be stored as.
    pub fn variant_for(&self, key: &Key) -> EntryVariant {
        let shape = classify(key, &self.context.inline_keys).shape();
        Self::variant_of(&self.context, shape)
    }

    /// Build an entry holding `key` and `value`.
    ///
    /// Never fails: keys that cannot be inlined are held by reference.
    /// A versioned region starts the entry at [`VersionStamp::INITIAL`].
    pub fn create_entry(&self, key: Key, value: StoredValue) -> RegionEntry {
        let plan = classify(&key, &self.context.inline_keys);
        let variant = Self::variant_of(&self.context, plan.shape());
        let key = InlineKey::encode(key, plan);
        let stamp = self.context.versioned.then_some(VersionStamp::INITIAL);
        RegionEntry::new(key, variant, value, stamp)
    }

    fn variant_of(context: &EntryContext, key_shape: KeyShape) -> EntryVariant {
        EntryVariant {
            key_shape,
            tier: context.tier,
            versioned: context.versioned,
            statistics: context.statistics,
            disk: context.disk,
            lru: context.lru,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionConfig;
    use crate::engine::entry::Lifecycle;
    use bytes::Bytes;
    use uuid::Uuid;

    fn factory(config: &RegionConfig) -> EntryFactory {
        EntryFactory::new(EntryContext::from_config(config))
    }

    fn versioned_overflow() -> RegionConfig {
        RegionConfig::default()
            .with_statistics(true)
            .with_eviction(EvictionConfig::overflow_entries(100))
    }

    #[test]
    fn test_variant_names() {
        let f = factory(&versioned_overflow());
        assert_eq!(
            f.variant_for(&Key::Int(1)).name(),
            "VersionedStatsDiskLRURegionEntryHeapIntKey"
        );
        let thin = factory(&RegionConfig::default().with_versioning(false));
        assert_eq!(
            thin.variant_for(&Key::from(vec![0u8; 3])).name(),
            "VMThinRegionEntryHeapObjectKey"
        );
    }

    #[test]
    fn test_variant_is_deterministic_per_shape() {
        let f = factory(&versioned_overflow());
        assert_eq!(f.variant_for(&Key::Int(1)), f.variant_for(&Key::Int(999)));
        assert_eq!(
            f.variant_for(&Key::from("abc")),
            f.variant_for(&Key::from("xyz"))
        );
        assert_eq!(
            f.variant_for(&Key::from("abcdefghij")).key_shape,
            KeyShape::String2
        );
        assert_eq!(
            f.variant_for(&Key::Uuid(Uuid::new_v4())),
            f.variant_for(&Key::Uuid(Uuid::new_v4()))
        );
    }

    #[test]
    fn test_entry_class_independent_of_key_shape() {
        let f = factory(&versioned_overflow());
        let int_entry = f.create_entry(Key::Int(1), StoredValue::Absent);
        let obj_entry = f.create_entry(Key::from(vec![1u8; 64]), StoredValue::Absent);
        assert_ne!(int_entry.variant(), obj_entry.variant());
        assert_eq!(f.entry_class().variant().key_shape, KeyShape::Object);
        assert_eq!(
            f.entry_class().name(),
            "VersionedStatsDiskLRURegionEntryHeapObjectKey"
        );
    }

    #[test]
    fn test_create_entry_populates_key_value_and_stamp() {
        let f = factory(&RegionConfig::default());
        let entry = f.create_entry(
            Key::from("user:1"),
            StoredValue::Heap(Bytes::from_static(b"alice")),
        );
        assert_eq!(entry.key(), Key::from("user:1"));
        assert!(entry.inline_key().is_inline());
        assert_eq!(entry.stamp(), Some(VersionStamp::INITIAL));
        assert_eq!(entry.lifecycle(), Lifecycle::Valid);
        assert_eq!(entry.recency(), 0);
    }

    #[test]
    fn test_unversioned_entry_has_no_stamp() {
        let f = factory(&RegionConfig::default().with_versioning(false));
        let entry = f.create_entry(Key::Long(5), StoredValue::Absent);
        assert_eq!(entry.stamp(), None);
        assert_eq!(entry.lifecycle(), Lifecycle::Tombstone);
    }

    #[test]
    fn test_statistics_add_to_overhead() {
        let plain = factory(&RegionConfig::default()).entry_class();
        let stats = factory(&RegionConfig::default().with_statistics(true)).entry_class();
        assert!(stats.estimated_overhead() > plain.estimated_overhead());
    }

    #[test]
    fn test_make_versioned_keeps_other_dimensions() {
        let thin = factory(&RegionConfig::default().with_versioning(false).with_statistics(true));
        let versioned = thin.make_versioned();
        assert!(versioned.context().versioned);
        assert_eq!(versioned.context().statistics, thin.context().statistics);
        assert_eq!(versioned.context().tier, thin.context().tier);
        assert_eq!(
            versioned.entry_class().name(),
            "VersionedStatsRegionEntryHeapObjectKey"
        );
        let entry = versioned.create_entry(Key::Int(1), StoredValue::Absent);
        assert_eq!(entry.stamp(), Some(VersionStamp::INITIAL));

        // Already versioned: same representation.
        assert_eq!(versioned.make_versioned().entry_class(), versioned.entry_class());
    }

    #[test]
    fn test_make_on_heap_switches_tier_only() {
        let offheap = factory(&versioned_overflow().with_memory_tier(MemoryTier::OffHeap));
        let heap = offheap.make_on_heap();
        assert_eq!(heap.context().tier, MemoryTier::Heap);
        assert_eq!(
            heap.entry_class().name(),
            factory(&versioned_overflow()).entry_class().name()
        );
        assert_ne!(heap.entry_class(), offheap.entry_class());
        assert!(heap.context().disk && heap.context().lru);
    }
}
