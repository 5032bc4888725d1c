//! GRIDCORE - Core Type Definitions
//! Defines fundamental types used across the storage core.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value type for region entries.
/// `Bytes` keeps clones cheap when values fan out to event sinks.
pub type Value = Bytes;

/// A region key.
///
/// Integers, UUIDs and short strings are eligible for inline encoding
/// inside the entry; everything else is held by reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    /// 32-bit integer key.
    Int(i32),
    /// 64-bit integer key.
    Long(i64),
    /// UUID key.
    Uuid(Uuid),
    /// String key of any length.
    Str(String),
    /// Opaque serialized key object.
    Object(Bytes),
}

impl Key {
    /// Representation-independent hash used by the region table.
    /// Inlined and reference-held copies of the same key hash identically.
    pub fn hash64(&self) -> u64 {
        match self {
            Key::Int(v) => hash_int(*v),
            Key::Long(v) => hash_long(*v),
            Key::Uuid(u) => {
                let (msb, lsb) = u.as_u64_pair();
                hash_uuid(msb, lsb)
            }
            Key::Str(s) => hash_str_bytes(s.as_bytes()),
            Key::Object(b) => hash_tagged(4, |h| {
                h.write_usize(b.len());
                h.write(b);
            }),
        }
    }

    /// Approximate heap footprint of a reference-held key.
    pub fn heap_size(&self) -> usize {
        match self {
            Key::Int(_) | Key::Long(_) | Key::Uuid(_) => 0,
            Key::Str(s) => s.capacity(),
            Key::Object(b) => b.len(),
        }
    }
}

// Per-kind pieces of `Key::hash64`, so inline keys hash without decoding.

fn hash_tagged(tag: u8, write: impl FnOnce(&mut DefaultHasher)) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write_u8(tag);
    write(&mut hasher);
    hasher.finish()
}

pub(crate) fn hash_int(v: i32) -> u64 {
    hash_tagged(0, |h| h.write_i32(v))
}

pub(crate) fn hash_long(v: i64) -> u64 {
    hash_tagged(1, |h| h.write_i64(v))
}

pub(crate) fn hash_uuid(msb: u64, lsb: u64) -> u64 {
    hash_tagged(2, |h| {
        h.write_u64(msb);
        h.write_u64(lsb);
    })
}

/// `utf8` is the string's UTF-8 encoding.
pub(crate) fn hash_str_bytes(utf8: &[u8]) -> u64 {
    hash_tagged(3, |h| {
        h.write_usize(utf8.len());
        h.write(utf8);
    })
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Long(v) => write!(f, "{}L", v),
            Key::Uuid(u) => write!(f, "{}", u),
            Key::Str(s) => write!(f, "\"{}\"", s),
            Key::Object(b) => write!(f, "<object {} bytes>", b.len()),
        }
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Long(v)
    }
}

impl From<Uuid> for Key {
    fn from(v: Uuid) -> Self {
        Key::Uuid(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key::Object(Bytes::from(v))
    }
}

/// Identifier of a distributed-system member that originated an update.
/// Member ids are totally ordered; the order breaks version ties.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
