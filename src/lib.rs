//! GRIDCORE - Region Entry Storage Core
//!
//! The entry-storage core of an in-memory data grid: represents, stores,
//! evicts and version-reconciles the key/value records of one region partition.
//!
//! ## Features
//! - **Inline Keys**: Small integers, UUIDs and short strings packed into the entry
//! - **Entry Factory**: One representation per (key shape, tier, versioning, stats, disk, LRU)
//! - **Version Stamps**: Coordination-free conflict resolution for replicated updates
//! - **LRU Eviction**: Lock-free recency tracking, fault-out to a disk overflow tier
//! - **Off-Heap Tier**: Values held as raw bytes in an arena outside the entry
//! - **Tombstones**: Destroyed keys keep their stamp until they expire
//! - **Access Gate**: Read-only handles for cache-provider bridges
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use gridcore::config::{EvictionConfig, RegionConfig};
//! use gridcore::engine::{Region, RemoteUpdate, VersionStamp};
//! use gridcore::types::{Key, MemberId};
//!
//! let config = RegionConfig::new("users", "./data")
//!     .with_eviction(EvictionConfig::overflow_entries(1_000));
//! let region = Region::open(config).unwrap();
//!
//! region.put("user:1", "alice").unwrap();
//! let stale = RemoteUpdate::update("user:1", "bob", VersionStamp::new(MemberId(2), 0, 0));
//! assert!(!region.apply_remote(stale).unwrap().is_applied());
//! assert_eq!(region.get(&Key::from("user:1")).unwrap().as_deref(), Some(&b"alice"[..]));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
