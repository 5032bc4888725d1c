//! GRIDCORE - Version Stamps & Conflict Resolution
//! Per-entry version metadata used to order concurrent, possibly
//! out-of-order replicated updates without coordination.
//!
//! ## Ordering
//! Stamps compare lexicographically on `(version, timestamp, member)`.
//! The higher stamp wins. An equal version from a different member is a
//! concurrent update; the tie-break makes every replica pick the same winner
//! regardless of arrival order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::MemberId;

/// Version metadata carried by a versioned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Member that produced this version.
    pub member: MemberId,
    /// Per-entry monotonic version counter.
    pub version: u64,
    /// Distributed timestamp (ms since epoch) of the update.
    pub timestamp: u64,
}

impl VersionStamp {
    /// Stamp of a freshly created entry that has not been written yet.
    pub const INITIAL: VersionStamp = VersionStamp {
        member: MemberId(0),
        version: 0,
        timestamp: 0,
    };

    pub const fn new(member: MemberId, version: u64, timestamp: u64) -> Self {
        Self {
            member,
            version,
            timestamp,
        }
    }

    /// Stamp for the next local write on top of `self`.
    /// The timestamp never moves backwards even if the wall clock does.
    /// `None` once the version counter is exhausted.
    pub fn next_local(&self, member: MemberId, now_ms: u64) -> Option<Self> {
        Some(Self {
            member,
            version: self.version.checked_add(1)?,
            timestamp: now_ms.max(self.timestamp),
        })
    }

    fn ordering_key(&self) -> (u64, u64, MemberId) {
        (self.version, self.timestamp, self.member)
    }
}

impl Ord for VersionStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl PartialOrd for VersionStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}/{}", self.version, self.timestamp, self.member)
    }
}

/// Why an incoming update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Older version than the entry holds.
    Stale,
    /// Same version, lost the timestamp/member tie-break.
    ConflictLoser,
    /// Identical stamp already applied.
    Duplicate,
}

/// Result of observing an update against an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOutcome {
    /// Newer version; value and stamp replaced.
    Applied,
    /// Same version from another member; the incoming update won the tie-break.
    AppliedAsConflictWinner,
    /// Not applied; entry unchanged.
    Rejected(RejectReason),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Applied | UpdateOutcome::AppliedAsConflictWinner
        )
    }
}

/// Decide whether `incoming` replaces `current`.
pub fn resolve(current: &VersionStamp, incoming: &VersionStamp) -> UpdateOutcome {
    match incoming.version.cmp(&current.version) {
        Ordering::Greater => UpdateOutcome::Applied,
        Ordering::Less => UpdateOutcome::Rejected(RejectReason::Stale),
        Ordering::Equal => match incoming.cmp(current) {
            Ordering::Greater => UpdateOutcome::AppliedAsConflictWinner,
            Ordering::Less => UpdateOutcome::Rejected(RejectReason::ConflictLoser),
            Ordering::Equal => UpdateOutcome::Rejected(RejectReason::Duplicate),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MemberId = MemberId(10);
    const B: MemberId = MemberId(20);

    #[test]
    fn test_newer_version_applies() {
        let current = VersionStamp::new(A, 4, 1_000);
        let incoming = VersionStamp::new(B, 5, 900);
        assert_eq!(resolve(&current, &incoming), UpdateOutcome::Applied);
    }

    #[test]
    fn test_older_version_is_stale() {
        let current = VersionStamp::new(A, 5, 1_000);
        let incoming = VersionStamp::new(B, 4, 9_000);
        assert_eq!(
            resolve(&current, &incoming),
            UpdateOutcome::Rejected(RejectReason::Stale)
        );
    }

    #[test]
    fn test_equal_version_breaks_tie_on_timestamp() {
        let current = VersionStamp::new(B, 5, 1_000);
        let incoming = VersionStamp::new(A, 5, 2_000);
        assert_eq!(
            resolve(&current, &incoming),
            UpdateOutcome::AppliedAsConflictWinner
        );
        assert_eq!(
            resolve(&incoming, &current),
            UpdateOutcome::Rejected(RejectReason::ConflictLoser)
        );
    }

    #[test]
    fn test_equal_version_and_timestamp_breaks_tie_on_member() {
        let from_a = VersionStamp::new(A, 5, 1_000);
        let from_b = VersionStamp::new(B, 5, 1_000);
        assert_eq!(
            resolve(&from_a, &from_b),
            UpdateOutcome::AppliedAsConflictWinner
        );
        assert_eq!(
            resolve(&from_b, &from_a),
            UpdateOutcome::Rejected(RejectReason::ConflictLoser)
        );
    }

    #[test]
    fn test_duplicate_delivery() {
        let stamp = VersionStamp::new(A, 3, 77);
        assert_eq!(
            resolve(&stamp, &stamp),
            UpdateOutcome::Rejected(RejectReason::Duplicate)
        );
    }

    #[test]
    fn test_next_local_is_monotonic() {
        let stamp = VersionStamp::new(A, 7, 5_000);
        let next = stamp.next_local(B, 4_000).unwrap(); // clock went backwards
        assert_eq!(next.version, 8);
        assert_eq!(next.timestamp, 5_000);
        assert_eq!(next.member, B);
        assert!(next > stamp);
    }

    #[test]
    fn test_next_local_at_max_version() {
        let stamp = VersionStamp::new(A, u64::MAX, 1);
        assert_eq!(stamp.next_local(B, 2), None);
        let almost = VersionStamp::new(A, u64::MAX - 1, 1);
        assert_eq!(almost.next_local(B, 2).unwrap().version, u64::MAX);
    }

    #[test]
    fn test_initial_loses_to_any_write() {
        let incoming = VersionStamp::new(A, 1, 0);
        assert!(resolve(&VersionStamp::INITIAL, &incoming).is_applied());
    }
}
