use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

/// Lightweight counters for pool/queue backpressure.
///
/// # Example
/// ```rust
/// use aperture_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.hit();
/// assert_eq!(metrics.hits(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    backpressure: AtomicU64,
}

impl Metrics {
    /// Increment hit counter.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment miss counter.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment allocation counter.
    pub fn alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment backpressure counter.
    pub fn backpressure(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn backpressure_count(&self) -> u64 {
        self.backpressure.load(Ordering::Relaxed)
    }
}

struct ProgressState {
    renewals: AtomicU64,
    last_tick_nanos: AtomicU64,
}

/// Forward-progress counter for one stage worker ("thread renew").
///
/// The worker calls `renew()` once per loop iteration that did real work;
/// the health monitor samples `count()` each interval and escalates when a
/// stage stops moving.
#[derive(Clone)]
pub struct StageProgress {
    origin: Instant,
    state: Arc<ProgressState>,
}

impl StageProgress {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(ProgressState {
                renewals: AtomicU64::new(0),
                last_tick_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Record one unit of forward progress.
    pub fn renew(&self) {
        self.state.renewals.fetch_add(1, Ordering::Relaxed);
        let nanos = self.origin.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.state.last_tick_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Total renewals so far.
    pub fn count(&self) -> u64 {
        self.state.renewals.load(Ordering::Relaxed)
    }

    /// Nanoseconds since construction of the last renewal, if any.
    pub fn last_tick_nanos(&self) -> Option<u64> {
        match self.state.last_tick_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(nanos),
        }
    }
}

impl Default for StageProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_and_timestamps() {
        let progress = StageProgress::new();
        assert_eq!(progress.count(), 0);
        assert!(progress.last_tick_nanos().is_none());
        progress.renew();
        progress.renew();
        assert_eq!(progress.count(), 2);
        let shared = progress.clone();
        shared.renew();
        assert_eq!(progress.count(), 3);
    }
}
