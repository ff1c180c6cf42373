use std::sync::atomic::{AtomicU32, Ordering};

/// Saturating down-counter coordinating one still-capture worker loop.
///
/// Each counter reaches zero exactly once per armed burst; a loop re-arms
/// itself only while its counter is non-zero.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::ShotCounter;
///
/// let counter = ShotCounter::new("jpeg");
/// counter.set(2);
/// assert_eq!(counter.dec(), 1);
/// assert_eq!(counter.dec(), 0);
/// assert_eq!(counter.dec(), 0);
/// ```
pub struct ShotCounter {
    name: &'static str,
    count: AtomicU32,
}

impl ShotCounter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicU32::new(0),
        }
    }

    /// Arm the counter for a burst of `n`.
    pub fn set(&self, n: u32) {
        self.count.store(n, Ordering::Release);
    }

    /// Decrement, saturating at zero; returns the new value.
    pub fn dec(&self) -> u32 {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev == 0 {
            log::debug!("counter {}: dec at zero ignored", self.name);
            return 0;
        }
        prev - 1
    }

    /// Current value.
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Force to zero (cancel paths).
    pub fn clear(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn is_zero(&self) -> bool {
        self.get() == 0
    }
}

/// The five shot-accounting counters driving independent capture loops.
pub struct ShotCounterSet {
    pub take_picture: ShotCounter,
    pub reprocessing: ShotCounter,
    pub picture: ShotCounter,
    pub jpeg: ShotCounter,
    pub jpeg_callback: ShotCounter,
}

impl ShotCounterSet {
    pub const fn new() -> Self {
        Self {
            take_picture: ShotCounter::new("take_picture"),
            reprocessing: ShotCounter::new("reprocessing"),
            picture: ShotCounter::new("picture"),
            jpeg: ShotCounter::new("jpeg"),
            jpeg_callback: ShotCounter::new("jpeg_callback"),
        }
    }

    /// Arm every counter for a burst of `k` shots.
    pub fn arm(&self, k: u32) {
        self.take_picture.set(k);
        self.reprocessing.set(k);
        self.picture.set(k);
        self.jpeg.set(k);
        self.jpeg_callback.set(k);
    }

    /// Force every counter to zero.
    pub fn clear(&self) {
        self.take_picture.clear();
        self.reprocessing.clear();
        self.picture.clear();
        self.jpeg.clear();
        self.jpeg_callback.clear();
    }

    /// Whether every loop has converged.
    pub fn all_zero(&self) -> bool {
        self.take_picture.is_zero()
            && self.reprocessing.is_zero()
            && self.picture.is_zero()
            && self.jpeg.is_zero()
            && self.jpeg_callback.is_zero()
    }
}

impl Default for ShotCounterSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_zero() {
        let counter = ShotCounter::new("t");
        counter.set(1);
        assert_eq!(counter.dec(), 0);
        assert_eq!(counter.dec(), 0);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn burst_reaches_zero_exactly_once() {
        for k in [1u32, 2, 4, 8] {
            let counter = ShotCounter::new("burst");
            counter.set(k);
            let mut zero_crossings = 0;
            for _ in 0..k + 3 {
                let before = counter.get();
                let after = counter.dec();
                if before > 0 && after == 0 {
                    zero_crossings += 1;
                }
            }
            assert_eq!(zero_crossings, 1, "k={k}");
        }
    }

    #[test]
    fn set_arms_all_and_clear_converges() {
        let set = ShotCounterSet::new();
        set.arm(4);
        assert!(!set.all_zero());
        set.clear();
        assert!(set.all_zero());
    }
}
