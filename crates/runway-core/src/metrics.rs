//! Global atomic counters for Runway scheduling and expansion.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits all of
//! them as one `tracing::info!` event; the scheduler calls it at the end of
//! every cycle.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    builds_created: AtomicU64,
    builds_reused: AtomicU64,
    children_expanded: AtomicU64,
    references_missing: AtomicU64,
    dump_mismatches: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            builds_created: AtomicU64::new(0),
            builds_reused: AtomicU64::new(0),
            children_expanded: AtomicU64::new(0),
            references_missing: AtomicU64::new(0),
            dump_mismatches: AtomicU64::new(0),
        }
    }

    pub fn inc_builds_created(&self) {
        self.builds_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_created", "counter incremented");
    }

    pub fn inc_builds_reused(&self) {
        self.builds_reused.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_reused", "counter incremented");
    }

    pub fn add_children_expanded(&self, n: u64) {
        self.children_expanded.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "children_expanded", n, "counter incremented");
    }

    pub fn inc_references_missing(&self) {
        self.references_missing.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "references_missing", "counter incremented");
    }

    pub fn inc_dump_mismatches(&self) {
        self.dump_mismatches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dump_mismatches", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds_created = self.builds_created(),
            builds_reused = self.builds_reused(),
            children_expanded = self.children_expanded(),
            references_missing = self.references_missing(),
            dump_mismatches = self.dump_mismatches(),
        );
    }

    pub fn builds_created(&self) -> u64 {
        self.builds_created.load(Ordering::Relaxed)
    }

    pub fn builds_reused(&self) -> u64 {
        self.builds_reused.load(Ordering::Relaxed)
    }

    pub fn children_expanded(&self) -> u64 {
        self.children_expanded.load(Ordering::Relaxed)
    }

    pub fn references_missing(&self) -> u64 {
        self.references_missing.load(Ordering::Relaxed)
    }

    pub fn dump_mismatches(&self) -> u64 {
        self.dump_mismatches.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.builds_created.store(0, Ordering::Relaxed);
        self.builds_reused.store(0, Ordering::Relaxed);
        self.children_expanded.store(0, Ordering::Relaxed);
        self.references_missing.store(0, Ordering::Relaxed);
        self.dump_mismatches.store(0, Ordering::Relaxed);
    }
}
