//! Lock-free counters tracking pool behavior.
//!
//! Every pool owns one `Metrics` instance shared by its per-thread
//! stacks and handoff queues. Counters are best-effort and cheap enough
//! to stay enabled in release builds.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed ordering for counters (eventual visibility is fine for metrics).
const RELAXED: Ordering = Ordering::Relaxed;

/// Collection of all pool metrics.
pub struct Metrics {
    /// Gets served from a per-thread stack (reuse).
    pub gets_pooled: AtomicU64,
    /// Gets that invoked the factory (fresh allocation).
    pub gets_fresh: AtomicU64,
    /// Recycles stored directly by the owner thread.
    pub recycles_direct: AtomicU64,
    /// Recycles published through a handoff queue.
    pub recycles_queued: AtomicU64,
    /// Handles dropped by the admission filter.
    pub drops_admission: AtomicU64,
    /// Handles dropped for capacity (full stack, spent shared budget,
    /// full registry, or cross-thread recycling disabled).
    pub drops_capacity: AtomicU64,
    /// Link batches moved from a handoff queue into a stack.
    pub transfers: AtomicU64,
    /// Handoff queues allocated.
    pub queues_created: AtomicU64,
    /// Dead producers' queues unlinked from a stack chain.
    pub queues_unlinked: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    pub const fn new() -> Self {
        Self {
            gets_pooled: AtomicU64::new(0),
            gets_fresh: AtomicU64::new(0),
            recycles_direct: AtomicU64::new(0),
            recycles_queued: AtomicU64::new(0),
            drops_admission: AtomicU64::new(0),
            drops_capacity: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            queues_created: AtomicU64::new(0),
            queues_unlinked: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_pooled_get(&self) {
        self.gets_pooled.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_fresh_get(&self) {
        self.gets_fresh.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_direct_recycle(&self) {
        self.recycles_direct.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_queued_recycle(&self) {
        self.recycles_queued.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_admission_drop(&self) {
        self.drops_admission.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_capacity_drop(&self) {
        self.drops_capacity.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_transfer(&self) {
        self.transfers.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_queue_created(&self) {
        self.queues_created.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn record_queue_unlinked(&self) {
        self.queues_unlinked.fetch_add(1, RELAXED);
    }

    /// Get a snapshot of all counters for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets_pooled: self.gets_pooled.load(RELAXED),
            gets_fresh: self.gets_fresh.load(RELAXED),
            recycles_direct: self.recycles_direct.load(RELAXED),
            recycles_queued: self.recycles_queued.load(RELAXED),
            drops_admission: self.drops_admission.load(RELAXED),
            drops_capacity: self.drops_capacity.load(RELAXED),
            transfers: self.transfers.load(RELAXED),
            queues_created: self.queues_created.load(RELAXED),
            queues_unlinked: self.queues_unlinked.load(RELAXED),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of pool metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub gets_pooled: u64,
    pub gets_fresh: u64,
    pub recycles_direct: u64,
    pub recycles_queued: u64,
    pub drops_admission: u64,
    pub drops_capacity: u64,
    pub transfers: u64,
    pub queues_created: u64,
    pub queues_unlinked: u64,
}

impl MetricsSnapshot {
    /// Fraction of gets served from the pool (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.gets_pooled + self.gets_fresh;
        if total == 0 {
            0.0
        } else {
            self.gets_pooled as f64 / total as f64
        }
    }
}
