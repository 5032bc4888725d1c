//! GRIDCORE - Entry Events
//! The `(key, value, stamp)` tuples a region produces for replication,
//! together with the conflict-resolution outcome so downstream replicas
//! apply the same winner.

use crossbeam_channel::Sender;

use crate::types::{Key, Value};

use super::version::{UpdateOutcome, VersionStamp};

/// Kind of mutation carried by an event or a replicated update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// New value.
    Update,
    /// Value dropped, entry kept.
    Invalidate,
    /// Entry tombstoned.
    Destroy,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOrigin {
    Local,
    Remote,
}

/// A replicated update delivered into the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub key: Key,
    pub operation: Operation,
    /// Required for `Operation::Update`, ignored otherwise.
    pub value: Option<Value>,
    pub stamp: VersionStamp,
}

impl RemoteUpdate {
    pub fn update(key: impl Into<Key>, value: impl Into<Value>, stamp: VersionStamp) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Update,
            value: Some(value.into()),
            stamp,
        }
    }

    pub fn destroy(key: impl Into<Key>, stamp: VersionStamp) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Destroy,
            value: None,
            stamp,
        }
    }

    pub fn invalidate(key: impl Into<Key>, stamp: VersionStamp) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Invalidate,
            value: None,
            stamp,
        }
    }
}

/// One mutation observed by the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEvent {
    pub key: Key,
    pub value: Option<Value>,
    /// Stamp after a local write, or the incoming stamp of a remote update.
    pub stamp: Option<VersionStamp>,
    pub operation: Operation,
    pub origin: EventOrigin,
    pub outcome: UpdateOutcome,
}

/// Receiver of region events. Called outside any entry lock.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: EntryEvent);
}

impl EventSink for Sender<EntryEvent> {
    fn on_event(&self, event: EntryEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberId;

    #[test]
    fn test_channel_sink_delivers() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stamp = VersionStamp::new(MemberId(3), 1, 10);
        tx.on_event(EntryEvent {
            key: Key::Int(1),
            value: Some(Value::from_static(b"v")),
            stamp: Some(stamp),
            operation: Operation::Update,
            origin: EventOrigin::Local,
            outcome: UpdateOutcome::Applied,
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, Key::Int(1));
        assert_eq!(event.stamp, Some(stamp));
    }

    #[test]
    fn test_sink_ignores_disconnected_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded::<EntryEvent>();
        drop(rx);
        tx.on_event(EntryEvent {
            key: Key::Int(1),
            value: None,
            stamp: None,
            operation: Operation::Destroy,
            origin: EventOrigin::Remote,
            outcome: UpdateOutcome::Applied,
        });
    }

    #[test]
    fn test_remote_update_constructors() {
        let stamp = VersionStamp::new(MemberId(1), 2, 3);
        let update = RemoteUpdate::update("k", Value::from_static(b"x"), stamp);
        assert_eq!(update.operation, Operation::Update);
        assert!(update.value.is_some());
        assert!(RemoteUpdate::destroy(7i32, stamp).value.is_none());
        assert_eq!(
            RemoteUpdate::invalidate(7i64, stamp).operation,
            Operation::Invalidate
        );
    }
}
