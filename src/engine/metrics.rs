//! GRIDCORE - Region Statistics
//! Atomic counters for region operations, conflict resolution and
//! eviction. They are the operator-facing signal for storage failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::version::{RejectReason, UpdateOutcome};

/// Operation counters for one region.
///
/// All counters use `Ordering::Relaxed`; they are read for reporting only.
#[derive(Debug)]
pub struct RegionStats {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    /// Gets that returned a value.
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub destroys: AtomicU64,
    pub invalidates: AtomicU64,
    /// Replicated updates observed.
    pub remote_updates: AtomicU64,
    pub stale_rejections: AtomicU64,
    pub conflict_wins: AtomicU64,
    pub conflict_losses: AtomicU64,
    pub duplicates: AtomicU64,
    pub fault_outs: AtomicU64,
    pub evict_destroys: AtomicU64,
    pub fault_ins: AtomicU64,
    pub fault_out_failures: AtomicU64,
    pub fault_in_failures: AtomicU64,
    pub expired_tombstones: AtomicU64,
    started: Instant,
}

impl RegionStats {
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            destroys: AtomicU64::new(0),
            invalidates: AtomicU64::new(0),
            remote_updates: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
            conflict_wins: AtomicU64::new(0),
            conflict_losses: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            fault_outs: AtomicU64::new(0),
            evict_destroys: AtomicU64::new(0),
            fault_ins: AtomicU64::new(0),
            fault_out_failures: AtomicU64::new(0),
            fault_in_failures: AtomicU64::new(0),
            expired_tombstones: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a replicated update by its resolution outcome.
    pub fn record_remote(&self, outcome: UpdateOutcome) {
        self.remote_updates.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            UpdateOutcome::Applied => return,
            UpdateOutcome::AppliedAsConflictWinner => &self.conflict_wins,
            UpdateOutcome::Rejected(RejectReason::Stale) => &self.stale_rejections,
            UpdateOutcome::Rejected(RejectReason::ConflictLoser) => &self.conflict_losses,
            UpdateOutcome::Rejected(RejectReason::Duplicate) => &self.duplicates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Fraction of gets that returned a value.
    pub fn hit_ratio(&self) -> f64 {
        let gets = Self::get(&self.gets);
        if gets == 0 {
            return 0.0;
        }
        Self::get(&self.hits) as f64 / gets as f64
    }

    /// Format statistics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ GRIDCORE Region Statistics ═══\n\
             Operations:\n\
               puts:        {}\n\
               gets:        {} (hit ratio {:.2})\n\
               destroys:    {}\n\
               invalidates: {}\n\
             Replication:\n\
               remote updates:   {}\n\
               stale rejected:   {}\n\
               conflict wins:    {}\n\
               conflict losses:  {}\n\
               duplicates:       {}\n\
             Eviction:\n\
               fault-outs:       {}\n\
               evict destroys:   {}\n\
               fault-ins:        {}\n\
               fault-out errors: {}\n\
               fault-in errors:  {}\n\
             Tombstones expired: {}\n\
             Uptime: {:.2}s",
            Self::get(&self.puts),
            Self::get(&self.gets),
            self.hit_ratio(),
            Self::get(&self.destroys),
            Self::get(&self.invalidates),
            Self::get(&self.remote_updates),
            Self::get(&self.stale_rejections),
            Self::get(&self.conflict_wins),
            Self::get(&self.conflict_losses),
            Self::get(&self.duplicates),
            Self::get(&self.fault_outs),
            Self::get(&self.evict_destroys),
            Self::get(&self.fault_ins),
            Self::get(&self.fault_out_failures),
            Self::get(&self.fault_in_failures),
            Self::get(&self.expired_tombstones),
            self.uptime_secs(),
        )
    }
}

impl Default for RegionStats {
    fn default() -> Self {
        Self::new()
    }
}
