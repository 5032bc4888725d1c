//! GRIDCORE - Region Configuration
//! Defines the static per-region context read by the entry factory
//! and the eviction controller.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GridError, Result};
use crate::types::MemberId;

/// Longest byte-encoded string that fits two inline slots (one byte holds the length).
pub const MAX_INLINE_BYTE_LEN: usize = 15;
/// Longest char-encoded string that fits two inline slots (one unit holds the length).
pub const MAX_INLINE_CHAR_LEN: usize = 7;

/// Where resident values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// Values are owned by the entry as `Bytes`.
    Heap,
    /// Values are copied into the region's off-heap arena.
    OffHeap,
}

/// Footprint measure compared against the eviction limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionLimit {
    /// Maximum number of resident values.
    Entries(usize),
    /// Maximum estimated resident bytes (entry overhead + value).
    Bytes(usize),
}

impl EvictionLimit {
    /// The raw limit value.
    pub fn value(&self) -> usize {
        match self {
            EvictionLimit::Entries(n) | EvictionLimit::Bytes(n) => *n,
        }
    }

    /// Same measure with a different limit.
    pub fn with_value(&self, value: usize) -> Self {
        match self {
            EvictionLimit::Entries(_) => EvictionLimit::Entries(value),
            EvictionLimit::Bytes(_) => EvictionLimit::Bytes(value),
        }
    }
}

/// What happens to a victim's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionAction {
    /// Fault the value out to the disk-overflow tier.
    OverflowToDisk,
    /// Drop the value; the entry is removed from the region.
    LocalDestroy,
}

/// LRU eviction settings.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub limit: EvictionLimit,
    pub action: EvictionAction,
    /// Run fault-out on a dedicated worker thread.
    pub background: bool,
    /// Maximum victims written to disk in one batch.
    pub batch_size: usize,
}

impl EvictionConfig {
    /// Overflow to disk once more than `max_entries` values are resident.
    pub fn overflow_entries(max_entries: usize) -> Self {
        Self {
            limit: EvictionLimit::Entries(max_entries),
            action: EvictionAction::OverflowToDisk,
            background: false,
            batch_size: 64,
        }
    }

    /// Overflow to disk once resident values (plus per-entry overhead)
    /// exceed `max_bytes`.
    pub fn overflow_bytes(max_bytes: usize) -> Self {
        Self {
            limit: EvictionLimit::Bytes(max_bytes),
            ..Self::overflow_entries(max_bytes)
        }
    }

    /// Run fault-out on the background worker.
    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Set the eviction action.
    pub fn with_action(mut self, action: EvictionAction) -> Self {
        self.action = action;
        self
    }
}

/// Which keys may be encoded inline in the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineKeyPolicy {
    pub enabled: bool,
    /// Strings of single-byte chars up to this length are inlined.
    pub max_byte_len: usize,
    /// Strings needing wider chars up to this length (in UTF-16 units) are inlined.
    pub max_char_len: usize,
}

impl Default for InlineKeyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_byte_len: MAX_INLINE_BYTE_LEN,
            max_char_len: MAX_INLINE_CHAR_LEN,
        }
    }
}

impl InlineKeyPolicy {
    /// Policy that holds every key by reference.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Configuration for one region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Region name, also used for the overflow file name.
    pub name: String,

    /// Directory holding the overflow file.
    pub data_dir: PathBuf,

    pub memory_tier: MemoryTier,

    /// Keep a version stamp per entry for conflict resolution.
    pub versioning: bool,

    /// Track per-entry hit/miss counts and access times.
    pub statistics: bool,

    /// `None` disables LRU tracking entirely.
    pub eviction: Option<EvictionConfig>,

    pub inline_keys: InlineKeyPolicy,

    /// How long a tombstone is retained for conflict resolution.
    pub tombstone_timeout: Duration,

    /// Member id stamped on local writes.
    pub local_member: MemberId,

    /// Whether to fsync overflow writes.
    pub sync_writes: bool,

    /// Attempts per overflow read or write before giving up.
    pub disk_retry_attempts: u32,

    /// Consecutive fault-out failures that close the region.
    pub max_consecutive_disk_failures: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: "region".to_string(),
            data_dir: PathBuf::from("./data"),
            memory_tier: MemoryTier::Heap,
            versioning: true,
            statistics: false,
            eviction: None,
            inline_keys: InlineKeyPolicy::default(),
            tombstone_timeout: Duration::from_secs(600), // 10 minutes
            local_member: MemberId(1),
            sync_writes: false,
            disk_retry_attempts: 3,
            max_consecutive_disk_failures: 16,
        }
    }
}

impl RegionConfig {
    /// Create a new config with a name and overflow directory.
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_memory_tier(mut self, tier: MemoryTier) -> Self {
        self.memory_tier = tier;
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.versioning = enabled;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = Some(eviction);
        self
    }

    pub fn with_inline_keys(mut self, policy: InlineKeyPolicy) -> Self {
        self.inline_keys = policy;
        self
    }

    pub fn with_tombstone_timeout(mut self, timeout: Duration) -> Self {
        self.tombstone_timeout = timeout;
        self
    }

    pub fn with_local_member(mut self, member: MemberId) -> Self {
        self.local_member = member;
        self
    }

    /// True when evicted values go to the overflow tier.
    pub fn overflows_to_disk(&self) -> bool {
        matches!(
            self.eviction,
            Some(EvictionConfig {
                action: EvictionAction::OverflowToDisk,
                ..
            })
        )
    }

    /// Path of the overflow file for this region.
    pub fn overflow_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.overflow", self.name))
    }

    /// Reject settings the region cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GridError::Config("region name must not be empty".into()));
        }
        if self.inline_keys.max_byte_len > MAX_INLINE_BYTE_LEN {
            return Err(GridError::Config(format!(
                "max_byte_len {} exceeds inline capacity {}",
                self.inline_keys.max_byte_len, MAX_INLINE_BYTE_LEN
            )));
        }
        if self.inline_keys.max_char_len > MAX_INLINE_CHAR_LEN {
            return Err(GridError::Config(format!(
                "max_char_len {} exceeds inline capacity {}",
                self.inline_keys.max_char_len, MAX_INLINE_CHAR_LEN
            )));
        }
        if let Some(eviction) = &self.eviction {
            if eviction.limit.value() == 0 {
                return Err(GridError::Config("eviction limit must be positive".into()));
            }
            if eviction.batch_size == 0 {
                return Err(GridError::Config("eviction batch size must be positive".into()));
            }
        }
        if self.disk_retry_attempts == 0 {
            return Err(GridError::Config("disk_retry_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RegionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_inline_policy() {
        let config = RegionConfig::default().with_inline_keys(InlineKeyPolicy {
            enabled: true,
            max_byte_len: 16,
            max_char_len: 7,
        });
        assert!(matches!(config.validate(), Err(GridError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_limit() {
        let config = RegionConfig::default().with_eviction(EvictionConfig::overflow_entries(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overflow_path() {
        let config = RegionConfig::new("orders", "/tmp/grid");
        assert_eq!(config.overflow_path(), PathBuf::from("/tmp/grid/orders.overflow"));
        assert!(!config.overflows_to_disk());
        let config = config.with_eviction(EvictionConfig::overflow_entries(10));
        assert!(config.overflows_to_disk());
    }

    #[test]
    fn test_limit_with_value_keeps_measure() {
        assert_eq!(EvictionLimit::Bytes(10).with_value(20), EvictionLimit::Bytes(20));
        assert_eq!(EvictionLimit::Entries(1).with_value(5).value(), 5);
    }

    #[test]
    fn test_overflow_bytes_measures_bytes() {
        let eviction = EvictionConfig::overflow_bytes(4096);
        assert_eq!(eviction.limit, EvictionLimit::Bytes(4096));
        assert_eq!(eviction.action, EvictionAction::OverflowToDisk);
        assert!(!eviction.background);
        let config = RegionConfig::default().with_eviction(eviction);
        assert!(config.validate().is_ok());
        assert!(config.overflows_to_disk());
    }
}
