//! GRIDCORE - Access Gate
//! Capability-restricted handles over a region, consumed by external
//! second-level cache bridges.
//!
//! The capability is fixed when the handle is built. A read-only handle
//! holds a [`RegionReader`], which has no mutating methods at all, so
//! `insert`/`update`/`after_insert`/`after_update` cannot reach the entries
//! and fail with `GridError::UnsupportedOperation`.

use crate::error::{GridError, Result};
use crate::types::{Key, Value};

use super::region::Region;

const INSERT_UNSUPPORTED: &str = "insert not supported on read only access";
const UPDATE_UNSUPPORTED: &str = "update not supported on read only access";

/// Capability of an access handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Entry operations exposed to a cache bridge.
pub trait EntryAccess: Send + Sync {
    fn mode(&self) -> AccessMode;

    fn get(&self, key: &Key) -> Result<Option<Value>>;

    /// Cache a value just loaded from the system of record.
    /// Never overwrites an existing value. Returns true if cached.
    fn put_from_load(&self, key: Key, value: Value) -> Result<bool>;

    /// Drop a cached item locally.
    fn evict(&self, key: &Key) -> Result<()>;

    /// Called when the bridge inserts an item. Returns true if the cache changed.
    fn insert(&self, key: Key, value: Value) -> Result<bool>;

    /// Called when the bridge updates an item. Returns true if the cache changed.
    fn update(&self, key: Key, value: Value) -> Result<bool>;

    /// Called after the insert was committed by the system of record.
    fn after_insert(&self, key: Key, value: Value) -> Result<bool>;

    /// Called after the update was committed by the system of record.
    fn after_update(&self, key: Key, value: Value) -> Result<bool>;
}

/// The read side of a region. Cache loads and local eviction count as reads:
/// they never change what the system of record holds.
#[derive(Clone)]
pub struct RegionReader {
    region: Region,
}

impl RegionReader {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.region.get(key)
    }

    pub fn load(&self, key: Key, value: Value) -> Result<bool> {
        self.region.create(key, value)
    }

    pub fn evict(&self, key: &Key) -> Result<()> {
        self.region.destroy(key).map(|_| ())
    }
}

/// Handle that rejects every mutation.
pub struct ReadOnlyAccess {
    reader: RegionReader,
}

impl ReadOnlyAccess {
    pub fn new(region: Region) -> Self {
        Self {
            reader: RegionReader::new(region),
        }
    }
}

impl EntryAccess for ReadOnlyAccess {
    fn mode(&self) -> AccessMode {
        AccessMode::ReadOnly
    }

    fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.reader.get(key)
    }

    fn put_from_load(&self, key: Key, value: Value) -> Result<bool> {
        self.reader.load(key, value)
    }

    fn evict(&self, key: &Key) -> Result<()> {
        self.reader.evict(key)
    }

    fn insert(&self, _key: Key, _value: Value) -> Result<bool> {
        Err(GridError::UnsupportedOperation(INSERT_UNSUPPORTED))
    }

    fn update(&self, _key: Key, _value: Value) -> Result<bool> {
        Err(GridError::UnsupportedOperation(UPDATE_UNSUPPORTED))
    }

    fn after_insert(&self, _key: Key, _value: Value) -> Result<bool> {
        Err(GridError::UnsupportedOperation(INSERT_UNSUPPORTED))
    }

    fn after_update(&self, _key: Key, _value: Value) -> Result<bool> {
        Err(GridError::UnsupportedOperation(UPDATE_UNSUPPORTED))
    }
}

/// Handle with full access. Writes land in `insert`/`update`; the
/// after-commit callbacks have nothing left to do.
pub struct ReadWriteAccess {
    region: Region,
}

impl ReadWriteAccess {
    pub fn new(region: Region) -> Self {
        Self { region }
    }
}

impl EntryAccess for ReadWriteAccess {
    fn mode(&self) -> AccessMode {
        AccessMode::ReadWrite
    }

    fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.region.get(key)
    }

    fn put_from_load(&self, key: Key, value: Value) -> Result<bool> {
        self.region.create(key, value)
    }

    fn evict(&self, key: &Key) -> Result<()> {
        self.region.destroy(key).map(|_| ())
    }

    fn insert(&self, key: Key, value: Value) -> Result<bool> {
        self.region.create(key, value)
    }

    fn update(&self, key: Key, value: Value) -> Result<bool> {
        self.region.put(key, value).map(|_| true)
    }

    fn after_insert(&self, _key: Key, _value: Value) -> Result<bool> {
        Ok(false)
    }

    fn after_update(&self, _key: Key, _value: Value) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;

    fn region() -> (tempfile::TempDir, Region) {
        let dir = tempfile::tempdir().unwrap();
        let region = Region::open(RegionConfig::new("gate", dir.path())).unwrap();
        (dir, region)
    }

    #[test]
    fn test_read_only_rejects_every_mutation() {
        let (_dir, region) = region();
        region.put("k", "original").unwrap();
        let before = region.get_entry(&Key::from("k")).unwrap();
        let access = region.access(AccessMode::ReadOnly);
        assert_eq!(access.mode(), AccessMode::ReadOnly);

        let v = || Value::from_static(b"changed");
        let results = [
            access.insert(Key::from("k"), v()),
            access.update(Key::from("k"), v()),
            access.after_insert(Key::from("k"), v()),
            access.after_update(Key::from("k"), v()),
            access.insert(Key::from("new"), v()),
        ];
        for result in results {
            assert!(result.unwrap_err().is_unsupported());
        }

        assert_eq!(region.get_entry(&Key::from("k")).unwrap(), before);
        assert!(!region.contains_key(&Key::from("new")));
    }

    #[test]
    fn test_read_only_messages() {
        let (_dir, region) = region();
        let access = region.access(AccessMode::ReadOnly);
        let err = access.insert(Key::Int(1), Value::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported operation: insert not supported on read only access"
        );
        let err = access.after_update(Key::Int(1), Value::new()).unwrap_err();
        assert!(matches!(
            err,
            GridError::UnsupportedOperation("update not supported on read only access")
        ));
    }

    #[test]
    fn test_read_only_allows_reads_and_loads() {
        let (_dir, region) = region();
        let access = region.access(AccessMode::ReadOnly);
        assert!(access.put_from_load(Key::Int(1), Value::from_static(b"db")).unwrap());
        assert!(!access.put_from_load(Key::Int(1), Value::from_static(b"other")).unwrap());
        assert_eq!(access.get(&Key::Int(1)).unwrap(), Some(Value::from_static(b"db")));
        access.evict(&Key::Int(1)).unwrap();
        assert_eq!(access.get(&Key::Int(1)).unwrap(), None);
    }

    #[test]
    fn test_read_write_access() {
        let (_dir, region) = region();
        let access = region.access(AccessMode::ReadWrite);
        assert!(access.insert(Key::Int(1), Value::from_static(b"a")).unwrap());
        assert!(!access.insert(Key::Int(1), Value::from_static(b"b")).unwrap());
        assert!(access.update(Key::Int(1), Value::from_static(b"c")).unwrap());
        assert!(!access.after_update(Key::Int(1), Value::from_static(b"c")).unwrap());
        assert!(!access.after_insert(Key::Int(1), Value::from_static(b"c")).unwrap());
        assert_eq!(region.get(&Key::Int(1)).unwrap(), Some(Value::from_static(b"c")));
    }
}
