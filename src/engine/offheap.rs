//! GRIDCORE - Off-Heap Value Arena
//! Holds raw encoded value bytes outside the entries of an off-heap region.
//! Entries keep only a compact `(slot, len)` address.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// Address of a block in the off-heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffHeapAddress {
    slot: u32,
    len: u32,
}

impl OffHeapAddress {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Arena {
    blocks: Vec<Option<Box<[u8]>>>,
    /// Slots released by `free`, reused before growing.
    free_slots: Vec<u32>,
}

/// Slot arena for off-heap values.
pub struct OffHeapStore {
    arena: Mutex<Arena>,
    used_bytes: AtomicUsize,
    live_blocks: AtomicUsize,
}

impl OffHeapStore {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena {
                blocks: Vec::new(),
                free_slots: Vec::new(),
            }),
            used_bytes: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
        }
    }

    /// Copy `bytes` into a new block.
    pub fn allocate(&self, bytes: &[u8]) -> OffHeapAddress {
        let block: Box<[u8]> = bytes.into();
        let mut arena = self.arena.lock();
        let slot = match arena.free_slots.pop() {
            Some(slot) => {
                arena.blocks[slot as usize] = Some(block);
                slot
            }
            None => {
                arena.blocks.push(Some(block));
                (arena.blocks.len() - 1) as u32
            }
        };
        drop(arena);

        self.used_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        OffHeapAddress {
            slot,
            len: bytes.len() as u32,
        }
    }

    /// Copy a block back out. `None` if the address was already freed.
    pub fn read(&self, addr: OffHeapAddress) -> Option<Bytes> {
        let arena = self.arena.lock();
        arena
            .blocks
            .get(addr.slot as usize)
            .and_then(|block| block.as_deref())
            .map(Bytes::copy_from_slice)
    }

    /// Release a block. Freeing twice is a no-op.
    pub fn free(&self, addr: OffHeapAddress) {
        let mut arena = self.arena.lock();
        let released = arena
            .blocks
            .get_mut(addr.slot as usize)
            .and_then(|block| block.take());
        if let Some(block) = released {
            arena.free_slots.push(addr.slot);
            drop(arena);
            self.used_bytes.fetch_sub(block.len(), Ordering::Relaxed);
            self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Bytes currently held by live blocks.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }
}

impl Default for OffHeapStore {
    fn default() -> Self {
        Self::new()
    }
}
