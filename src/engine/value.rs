//! GRIDCORE - Stored Values
//! How an entry holds its value in each storage tier, and the region-wide
//! store that moves values between tiers.

use std::sync::Arc;

use crate::config::MemoryTier;
use crate::error::{GridError, Result};
use crate::types::{Key, Value};

use super::offheap::{OffHeapAddress, OffHeapStore};
use super::overflow::{with_retry, DiskStore, DiskToken};

/// The value slot of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// No value: invalid entries and tombstones.
    Absent,
    /// Resident, owned by the entry.
    Heap(Value),
    /// Resident, encoded in the off-heap arena.
    OffHeap(OffHeapAddress),
    /// Faulted out to the overflow tier.
    Overflowed(DiskToken),
}

impl StoredValue {
    /// True if the value is held in memory.
    pub fn is_resident(&self) -> bool {
        matches!(self, StoredValue::Heap(_) | StoredValue::OffHeap(_))
    }

    pub fn is_overflowed(&self) -> bool {
        matches!(self, StoredValue::Overflowed(_))
    }

    /// Length of the resident value, 0 otherwise.
    pub fn resident_len(&self) -> usize {
        match self {
            StoredValue::Heap(v) => v.len(),
            StoredValue::OffHeap(addr) => addr.len(),
            StoredValue::Absent | StoredValue::Overflowed(_) => 0,
        }
    }
}

/// Region-wide value storage across memory tier and overflow tier.
pub struct ValueStore {
    tier: MemoryTier,
    offheap: OffHeapStore,
    disk: Option<Arc<dyn DiskStore>>,
    retry_attempts: u32,
}

impl ValueStore {
    pub fn new(tier: MemoryTier, disk: Option<Arc<dyn DiskStore>>, retry_attempts: u32) -> Self {
        Self {
            tier,
            offheap: OffHeapStore::new(),
            disk,
            retry_attempts: retry_attempts.max(1),
        }
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn offheap(&self) -> &OffHeapStore {
        &self.offheap
    }

    pub fn disk(&self) -> Option<&Arc<dyn DiskStore>> {
        self.disk.as_ref()
    }

    /// Place a value in the memory tier.
    pub fn store(&self, value: Value) -> StoredValue {
        match self.tier {
            MemoryTier::Heap => StoredValue::Heap(value),
            MemoryTier::OffHeap => StoredValue::OffHeap(self.offheap.allocate(&value)),
        }
    }

    /// The resident value, if any. Overflowed values need `read_overflow`.
    pub fn resident(&self, stored: &StoredValue) -> Result<Option<Value>> {
        match stored {
            StoredValue::Heap(v) => Ok(Some(v.clone())),
            StoredValue::OffHeap(addr) => self.offheap.read(*addr).map(Some).ok_or_else(|| {
                GridError::Corruption(format!("off-heap block {:?} already freed", addr))
            }),
            StoredValue::Absent | StoredValue::Overflowed(_) => Ok(None),
        }
    }

    /// Write values to the overflow tier, retrying transient I/O failures.
    pub fn write_overflow(&self, records: &[(Key, Value)]) -> Result<Vec<DiskToken>> {
        let disk = self.disk.as_ref().ok_or_else(|| {
            GridError::Config("region has no disk store for overflow".into())
        })?;
        with_retry(self.retry_attempts, || disk.write_batch(records))
    }

    /// Read a faulted-out value, retrying transient I/O failures.
    pub fn read_overflow(&self, token: DiskToken) -> Result<Value> {
        let disk = self.disk.as_ref().ok_or_else(|| {
            GridError::Config("region has no disk store for overflow".into())
        })?;
        with_retry(self.retry_attempts, || disk.read(token))
    }

    /// Release whatever backs `stored`.
    pub fn release(&self, stored: StoredValue) {
        match stored {
            StoredValue::OffHeap(addr) => self.offheap.free(addr),
            StoredValue::Overflowed(token) => {
                if let Some(disk) = &self.disk {
                    disk.release(token);
                }
            }
            StoredValue::Heap(_) | StoredValue::Absent => {}
        }
    }
}
