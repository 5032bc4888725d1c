//! GRIDCORE - Entry Storage Engine Module
//! Components of the region entry storage core, leaves first.

pub mod inline_key;
pub mod version;
pub mod offheap;
pub mod overflow;
pub mod value;
pub mod event;
pub mod entry;
pub mod factory;
pub mod lru;
pub mod table;
pub mod tombstone;
pub mod metrics;
pub mod gate;
pub mod region;

pub use entry::{EntrySnapshot, Lifecycle};
pub use event::{EntryEvent, EventOrigin, EventSink, Operation, RemoteUpdate};
pub use gate::{AccessMode, EntryAccess};
pub use region::{Region, ResyncRecord};
pub use version::{RejectReason, UpdateOutcome, VersionStamp};
