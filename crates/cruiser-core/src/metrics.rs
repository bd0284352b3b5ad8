//! Atomic counters for monitor observability.
//!
//! All counters use relaxed ordering — they are advisory/diagnostic,
//! not synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-context operation counters.
pub struct Metrics {
    /// Intercepted `malloc` calls (protected path only).
    pub mallocs: AtomicU64,
    /// Intercepted `free` calls (protected path only).
    pub frees: AtomicU64,
    /// Intercepted `realloc` calls that neither freed nor fell back to malloc.
    pub reallocs: AtomicU64,
    /// Intercepted `calloc` calls (protected path only).
    pub callocs: AtomicU64,
    /// Descriptors pushed into per-thread rings.
    pub produced: AtomicU64,
    /// Descriptors dropped because a ring was full and growth failed.
    pub dropped: AtomicU64,
    /// Descriptors moved from rings into the container.
    pub transmitted: AtomicU64,
    /// Completed monitor rounds.
    pub rounds: AtomicU64,
    /// Per-buffer checks performed across all rounds.
    pub checks: AtomicU64,
    /// Buffers whose deferred release was completed by the monitor (lazy).
    pub delayed_frees: AtomicU64,
    /// Descriptors dropped because their region was already returned to the
    /// OS when the monitor looked (eager).
    pub vanished: AtomicU64,
    /// Duplicate frees detected (when the check is enabled).
    pub duplicate_frees: AtomicU64,
    /// Attacks detected, across all detection sites.
    pub attacks: AtomicU64,
    /// Payload bytes handed out through encapsulated allocations.
    pub allocated_bytes: AtomicU64,
    /// Payload bytes returned to the host allocator.
    pub reclaimed_bytes: AtomicU64,
    /// Buffers observed live in the most recent completed round.
    pub last_round_live: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            reallocs: AtomicU64::new(0),
            callocs: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            delayed_frees: AtomicU64::new(0),
            vanished: AtomicU64::new(0),
            duplicate_frees: AtomicU64::new(0),
            attacks: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
            last_round_live: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters into a displayable summary.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            mallocs: Self::get(&self.mallocs),
            frees: Self::get(&self.frees),
            reallocs: Self::get(&self.reallocs),
            callocs: Self::get(&self.callocs),
            produced: Self::get(&self.produced),
            dropped: Self::get(&self.dropped),
            transmitted: Self::get(&self.transmitted),
            rounds: Self::get(&self.rounds),
            checks: Self::get(&self.checks),
            delayed_frees: Self::get(&self.delayed_frees),
            vanished: Self::get(&self.vanished),
            duplicate_frees: Self::get(&self.duplicate_frees),
            attacks: Self::get(&self.attacks),
            allocated_bytes: Self::get(&self.allocated_bytes),
            reclaimed_bytes: Self::get(&self.reclaimed_bytes),
            last_round_live: Self::get(&self.last_round_live),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub mallocs: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub callocs: u64,
    pub produced: u64,
    pub dropped: u64,
    pub transmitted: u64,
    pub rounds: u64,
    pub checks: u64,
    pub delayed_frees: u64,
    pub vanished: u64,
    pub duplicate_frees: u64,
    pub attacks: u64,
    pub allocated_bytes: u64,
    pub reclaimed_bytes: u64,
    pub last_round_live: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.mallocs, 0);
        assert_eq!(snap.attacks, 0);
    }

    #[test]
    fn increment_works() {
        let m = Metrics::new();
        Metrics::inc(&m.produced);
        Metrics::inc(&m.produced);
        Metrics::add(&m.transmitted, 2);
        let snap = m.snapshot();
        assert_eq!(snap.produced, 2);
        assert_eq!(snap.transmitted, 2);
    }
}
