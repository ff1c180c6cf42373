use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Hardware frames between the flash main trigger and the first frame that
/// reflects it; the selector syncs on `current + offset`.
pub const FLASH_SYNC_OFFSET: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStep {
    Off,
    PreTrigger,
    Main,
}

/// Flash coordination consulted by the capture path.
///
/// The session only needs the call contract: whether a pre-capture sequence
/// is required, and which hardware frame count the capture selector should
/// wait for once the main trigger fired.
pub struct FlashController {
    required: AtomicBool,
    step: Mutex<FlashStep>,
    target: AtomicU32,
}

impl FlashController {
    pub fn new() -> Self {
        Self {
            required: AtomicBool::new(false),
            step: Mutex::new(FlashStep::Off),
            target: AtomicU32::new(0),
        }
    }

    pub fn set_required(&self, required: bool) {
        self.required.store(required, Ordering::Release);
    }

    pub fn required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    /// Run the pre/main trigger sequence; returns the hardware frame count
    /// the capture must sync to, or `None` when flash is off.
    pub fn begin_capture(&self, current_hw_frame: u32) -> Option<u32> {
        if !self.required() {
            return None;
        }
        let mut step = self.step.lock();
        *step = FlashStep::PreTrigger;
        *step = FlashStep::Main;
        let target = current_hw_frame + FLASH_SYNC_OFFSET;
        self.target.store(target, Ordering::Release);
        log::debug!("flash: main trigger, sync target {target}");
        Some(target)
    }

    pub fn step(&self) -> FlashStep {
        *self.step.lock()
    }

    /// Capture done or aborted; back to off.
    pub fn finish_capture(&self) {
        *self.step.lock() = FlashStep::Off;
        self.target.store(0, Ordering::Release);
    }
}

impl Default for FlashController {
    fn default() -> Self {
        Self::new()
    }
}

/// Autofocus call contract: continuous AF during preview, a lock before
/// capture, unlock after.
pub struct AutoFocus {
    continuous: AtomicBool,
    locked: AtomicBool,
}

impl AutoFocus {
    pub fn new() -> Self {
        Self {
            continuous: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }

    pub fn arm_continuous(&self) {
        self.continuous.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.continuous.store(false, Ordering::Release);
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::Acquire)
    }

    /// Lock focus for a capture; reports whether a lock was taken.
    pub fn lock_for_capture(&self) -> bool {
        self.locked.store(true, Ordering::Release);
        true
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Default for AutoFocus {
    fn default() -> Self {
        Self::new()
    }
}

/// Special capture flavors that change burst accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCaptureMode {
    None,
    Hdr,
    LowLight { shots: u32 },
    LongExposure { duration_ms: u64 },
}

const EXPOSURE_IDLE: u8 = 0;
const EXPOSURE_STOP_REQUESTED: u8 = 1;
const EXPOSURE_STOP_OBSERVED: u8 = 2;

/// Special-capture state machine: HDR/low-light shot counts and the
/// long-exposure abort handshake.
///
/// Cancellation is race-free against a worker mid-exposure: the stop flag
/// is only acknowledged from inside the exposure loop, and counters are
/// cleared by the canceller only after the flag was observed.
pub struct SpecialCapture {
    mode: Mutex<SpecialCaptureMode>,
    exposure: AtomicU8,
}

impl SpecialCapture {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(SpecialCaptureMode::None),
            exposure: AtomicU8::new(EXPOSURE_IDLE),
        }
    }

    pub fn set_mode(&self, mode: SpecialCaptureMode) {
        *self.mode.lock() = mode;
    }

    pub fn mode(&self) -> SpecialCaptureMode {
        *self.mode.lock()
    }

    /// Shots a burst must account for under the current mode.
    pub fn shots_for(&self, series_shot_count: u32) -> u32 {
        match self.mode() {
            SpecialCaptureMode::None => series_shot_count.max(1),
            SpecialCaptureMode::Hdr => 2,
            SpecialCaptureMode::LowLight { shots } => shots.max(1),
            SpecialCaptureMode::LongExposure { .. } => 1,
        }
    }

    /// Poll point for the exposure loop: true means abort now.
    pub fn exposure_stop_requested(&self) -> bool {
        self.exposure
            .compare_exchange(
                EXPOSURE_STOP_REQUESTED,
                EXPOSURE_STOP_OBSERVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Request a long-exposure abort and wait (bounded) until the exposure
    /// loop observed it. Returns false when nothing observed the flag in
    /// time, in which case counters must not be cleared yet.
    pub fn request_exposure_stop(&self, wait: Duration) -> bool {
        if self
            .exposure
            .compare_exchange(
                EXPOSURE_IDLE,
                EXPOSURE_STOP_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Already requested or already observed.
            if self.exposure.load(Ordering::Acquire) == EXPOSURE_STOP_OBSERVED {
                return true;
            }
        }
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.exposure.load(Ordering::Acquire) == EXPOSURE_STOP_OBSERVED {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Arm a fresh exposure (clears a previous handshake).
    pub fn begin_exposure(&self) {
        self.exposure.store(EXPOSURE_IDLE, Ordering::Release);
    }

    /// Exposure finished normally.
    pub fn finish_exposure(&self) {
        self.exposure.store(EXPOSURE_IDLE, Ordering::Release);
    }
}

impl Default for SpecialCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn flash_sync_target_offsets_current_frame() {
        let flash = FlashController::new();
        assert!(flash.begin_capture(10).is_none());
        flash.set_required(true);
        assert_eq!(flash.begin_capture(10), Some(10 + FLASH_SYNC_OFFSET));
        assert_eq!(flash.step(), FlashStep::Main);
        flash.finish_capture();
        assert_eq!(flash.step(), FlashStep::Off);
    }

    #[test]
    fn shots_follow_special_mode() {
        let special = SpecialCapture::new();
        assert_eq!(special.shots_for(4), 4);
        special.set_mode(SpecialCaptureMode::Hdr);
        assert_eq!(special.shots_for(1), 2);
        special.set_mode(SpecialCaptureMode::LowLight { shots: 5 });
        assert_eq!(special.shots_for(1), 5);
        special.set_mode(SpecialCaptureMode::LongExposure { duration_ms: 800 });
        assert_eq!(special.shots_for(8), 1);
    }

    #[test]
    fn exposure_cancel_waits_for_observation() {
        let special = Arc::new(SpecialCapture::new());
        special.begin_exposure();

        let looper = special.clone();
        let handle = thread::spawn(move || {
            // Simulated exposure loop polling the stop flag.
            for _ in 0..200 {
                if looper.exposure_stop_requested() {
                    return true;
                }
                thread::sleep(Duration::from_millis(2));
            }
            false
        });

        assert!(special.request_exposure_stop(Duration::from_secs(2)));
        assert!(handle.join().expect("exposure loop"));
    }

    #[test]
    fn exposure_cancel_times_out_unobserved() {
        let special = SpecialCapture::new();
        special.begin_exposure();
        assert!(!special.request_exposure_stop(Duration::from_millis(20)));
    }
}
