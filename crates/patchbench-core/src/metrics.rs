//! Global atomic counters for patchbench.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit the current values as one `info!` event,
//! typically at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    layers_built: AtomicU64,
    cache_hits: AtomicU64,
    dedup_waits: AtomicU64,
    evictions: AtomicU64,
    sandbox_launches: AtomicU64,
    timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            layers_built: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            dedup_waits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sandbox_launches: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn inc_layers_built(&self) {
        self.layers_built.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "layers_built", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    /// A caller joined a build already in flight.
    pub fn inc_dedup_waits(&self) {
        self.dedup_waits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dedup_waits", "counter incremented");
    }

    pub fn inc_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evictions", "counter incremented");
    }

    pub fn inc_sandbox_launches(&self) {
        self.sandbox_launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandbox_launches", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            layers_built = self.layers_built(),
            cache_hits = self.cache_hits(),
            dedup_waits = self.dedup_waits(),
            evictions = self.evictions(),
            sandbox_launches = self.sandbox_launches(),
            timeouts = self.timeouts(),
        );
    }

    pub fn layers_built(&self) -> u64 {
        self.layers_built.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn dedup_waits(&self) -> u64 {
        self.dedup_waits.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn sandbox_launches(&self) -> u64 {
        self.sandbox_launches.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.layers_built.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.dedup_waits.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.sandbox_launches.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
    }
}
