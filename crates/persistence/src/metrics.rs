//! Lock-free observability counters for the persistence pipeline. spec.md
//! §4.7 calls out "counter incremented" for dropped/overflowed/permanently-
//! failed bundles without specifying a mechanism; `AtomicU64` counters are
//! the lightest option that fits "no locks in the hot path" (spec.md §5),
//! mirroring `event_bus.rs`'s own use of atomics for its sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    committed: AtomicU64,
    deduplicated: AtomicU64,
    overflowed: AtomicU64,
    permanent_failures: AtomicU64,
    replayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub committed: u64,
    pub deduplicated: u64,
    pub overflowed: u64,
    pub permanent_failures: u64,
    pub replayed: u64,
}

impl Metrics {
    pub fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflowed(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            committed: self.committed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_every_recorded_kind() {
        let metrics = Metrics::default();
        metrics.record_committed();
        metrics.record_committed();
        metrics.record_overflowed();
        metrics.record_permanent_failure();
        metrics.record_replayed();

        let snap = metrics.snapshot();
        assert_eq!(snap.committed, 2);
        assert_eq!(snap.overflowed, 1);
        assert_eq!(snap.permanent_failures, 1);
        assert_eq!(snap.replayed, 1);
    }
}
