use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use aperture_core::prelude::Frame;

/// Deeper hold depth used while dynamic-bayer reprocessing is active, so a
/// capture request can reach back past the frame currently being consumed.
pub const REPROCESSING_HOLD_COUNT: usize = 3;

/// How the selector picks a winner out of the hold list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCriterion {
    /// Oldest held frame wins.
    FirstAvailable,
    /// First frame whose hardware frame counter reached the target; older
    /// frames are rejected. Used for flash/HDR capture sync.
    HwFrameCountAtLeast(u32),
    /// Frame with this exact frame count, as chosen by a best-photo plugin.
    BestFrameNumber(u64),
}

struct SelectorState {
    hold: VecDeque<Frame>,
    hold_count: usize,
    criterion: SelectionCriterion,
    first_frame: bool,
    cancelled: bool,
}

/// Bounded hold list of candidate frames for still capture.
///
/// Stage workers hand capture-tap frames here instead of forwarding them;
/// held frames are complete and locked so the frame manager refuses to
/// delete them out from under a pending selection.
pub struct CaptureSelector {
    state: Mutex<SelectorState>,
    cond: Condvar,
    retry_wait: Duration,
}

impl CaptureSelector {
    /// `retry_wait` is the sleep between selection retries.
    pub fn new(retry_wait: Duration) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                hold: VecDeque::new(),
                hold_count: 1,
                criterion: SelectionCriterion::FirstAvailable,
                first_frame: true,
                cancelled: false,
            }),
            cond: Condvar::new(),
            retry_wait,
        }
    }

    /// Configure hold-list depth; returns frames evicted by a shrink.
    pub fn set_frame_hold_count(&self, n: usize) -> Vec<Frame> {
        let mut state = self.state.lock();
        state.hold_count = n.max(1);
        let mut evicted = Vec::new();
        while state.hold.len() > state.hold_count {
            if let Some(frame) = state.hold.pop_front() {
                frame.unlock();
                evicted.push(frame);
            }
        }
        evicted
    }

    /// Insert a candidate, evicting the oldest entries over capacity.
    ///
    /// The inserted frame is locked while held; evicted frames come back
    /// unlocked for the caller to release and delete.
    pub fn manage_frame_hold_list(&self, frame: Frame) -> Vec<Frame> {
        frame.lock();
        let mut state = self.state.lock();
        state.hold.push_back(frame);
        let mut evicted = Vec::new();
        while state.hold.len() > state.hold_count {
            if let Some(old) = state.hold.pop_front() {
                log::debug!("selector: evicting frame {}", old.count());
                old.unlock();
                evicted.push(old);
            }
        }
        drop(state);
        self.cond.notify_all();
        evicted
    }

    /// Pick the current criterion's winner, blocking with bounded retries.
    ///
    /// Returns `(winner, rejects)`; rejects are frames the criterion walked
    /// past (older than a sync target). A `None` winner after the retry
    /// budget means this capture iteration produced no output.
    pub fn select_frames(&self, retry_count: u32) -> (Option<Frame>, Vec<Frame>) {
        let mut rejects = Vec::new();
        let mut state = self.state.lock();
        for attempt in 0..=retry_count {
            if state.cancelled {
                log::info!("selector: selection cancelled");
                return (None, rejects);
            }
            match state.criterion {
                SelectionCriterion::FirstAvailable => {
                    if let Some(frame) = state.hold.pop_front() {
                        frame.unlock();
                        return (Some(frame), rejects);
                    }
                }
                SelectionCriterion::HwFrameCountAtLeast(target) => {
                    while let Some(frame) = state.hold.pop_front() {
                        if frame.meta().dynamic.hw_frame_count >= target {
                            frame.unlock();
                            return (Some(frame), rejects);
                        }
                        frame.unlock();
                        rejects.push(frame);
                    }
                }
                SelectionCriterion::BestFrameNumber(count) => {
                    if let Some(pos) = state.hold.iter().position(|f| f.count() == count)
                        && let Some(frame) = state.hold.remove(pos)
                    {
                        frame.unlock();
                        return (Some(frame), rejects);
                    }
                }
            }
            if attempt < retry_count {
                self.cond.wait_for(&mut state, self.retry_wait);
            }
        }
        log::warn!("selector: no frame matched after {} retries", retry_count);
        (None, rejects)
    }

    /// Selection criterion for the next `select_frames` calls.
    pub fn set_criterion(&self, criterion: SelectionCriterion) {
        self.state.lock().criterion = criterion;
        self.cond.notify_all();
    }

    /// Mark the start (true) or continuation (false) of a capture burst.
    ///
    /// Starting a burst also clears a previous cancellation.
    pub fn set_is_first_frame(&self, first: bool) {
        let mut state = self.state.lock();
        state.first_frame = first;
        if first {
            state.cancelled = false;
        }
    }

    pub fn is_first_frame(&self) -> bool {
        self.state.lock().first_frame
    }

    /// Abort any pending selection; blocked callers return promptly.
    pub fn cancel_picture(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }

    /// Force-drain the hold list (teardown); frames come back unlocked.
    pub fn release(&self) -> Vec<Frame> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();
        while let Some(frame) = state.hold.pop_front() {
            frame.unlock();
            drained.push(frame);
        }
        drained
    }

    /// Frames currently held.
    pub fn len(&self) -> usize {
        self.state.lock().hold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::stage;
    use aperture_core::prelude::*;
    use smallvec::smallvec;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn manager() -> Arc<FrameManager> {
        let m = Arc::new(FrameManager::new("sel", 32));
        m.start();
        m
    }

    fn held_frame(manager: &FrameManager, count: u64, hw: u32) -> Frame {
        let config = FrameCreateConfig {
            kind: FrameKind::Capture,
            request: RequestFlags::default(),
            stages: smallvec![stage::CAPTURE_TAP],
        };
        let frame = manager.create_frame(&config, count).expect("create");
        frame.store_meta(
            DynamicMeta {
                hw_frame_count: hw,
                ..DynamicMeta::default()
            },
            UserMeta::default(),
        );
        frame
            .set_entity_state(stage::CAPTURE_TAP, EntityState::Processing)
            .expect("processing");
        frame
            .set_entity_state(stage::CAPTURE_TAP, EntityState::FrameDone)
            .expect("done");
        frame
            .set_entity_state(stage::CAPTURE_TAP, EntityState::Complete)
            .expect("complete");
        frame
    }

    #[test]
    fn hold_list_evicts_oldest_over_capacity() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.set_frame_hold_count(2);
        assert!(selector.manage_frame_hold_list(held_frame(&m, 1, 1)).is_empty());
        assert!(selector.manage_frame_hold_list(held_frame(&m, 2, 2)).is_empty());
        let evicted = selector.manage_frame_hold_list(held_frame(&m, 3, 3));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].count(), 1);
        assert!(!evicted[0].is_locked());
        assert_eq!(selector.len(), 2);
    }

    #[test]
    fn held_frames_are_locked_against_deletion() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.manage_frame_hold_list(held_frame(&m, 1, 1));
        let (winner, _) = selector.select_frames(0);
        let winner = winner.expect("winner");
        // Unlocked on the way out, so the manager accepts deletion now.
        assert!(!winner.is_locked());
        m.delete_frame(winner).expect("delete");
    }

    #[test]
    fn first_available_pops_in_arrival_order() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.set_frame_hold_count(4);
        for n in 1..=3 {
            selector.manage_frame_hold_list(held_frame(&m, n, n as u32));
        }
        let (winner, rejects) = selector.select_frames(0);
        assert_eq!(winner.expect("winner").count(), 1);
        assert!(rejects.is_empty());
    }

    #[test]
    fn hw_frame_count_sync_rejects_older_frames() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.set_frame_hold_count(4);
        for n in 1..=3u64 {
            selector.manage_frame_hold_list(held_frame(&m, n, n as u32));
        }
        selector.set_criterion(SelectionCriterion::HwFrameCountAtLeast(3));
        let (winner, rejects) = selector.select_frames(0);
        assert_eq!(winner.expect("winner").count(), 3);
        assert_eq!(rejects.len(), 2);
    }

    #[test]
    fn best_frame_number_picks_exact_frame() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.set_frame_hold_count(4);
        for n in 1..=3u64 {
            selector.manage_frame_hold_list(held_frame(&m, n, n as u32));
        }
        selector.set_criterion(SelectionCriterion::BestFrameNumber(2));
        let (winner, rejects) = selector.select_frames(0);
        assert_eq!(winner.expect("winner").count(), 2);
        assert!(rejects.is_empty());
        assert_eq!(selector.len(), 2);
    }

    #[test]
    fn selection_timeout_returns_none() {
        let selector = CaptureSelector::new(Duration::from_millis(10));
        let start = Instant::now();
        let (winner, _) = selector.select_frames(2);
        assert!(winner.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_unblocks_pending_selection() {
        let selector = Arc::new(CaptureSelector::new(Duration::from_millis(500)));
        let cancelling = selector.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancelling.cancel_picture();
        });
        let start = Instant::now();
        let (winner, _) = selector.select_frames(100);
        assert!(winner.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("cancel thread");
        // A new burst clears the cancellation.
        selector.set_is_first_frame(true);
        let m = manager();
        selector.manage_frame_hold_list(held_frame(&m, 9, 9));
        let (winner, _) = selector.select_frames(0);
        assert!(winner.is_some());
    }

    #[test]
    fn release_drains_everything_unlocked() {
        let m = manager();
        let selector = CaptureSelector::new(Duration::from_millis(5));
        selector.set_frame_hold_count(4);
        for n in 1..=3u64 {
            selector.manage_frame_hold_list(held_frame(&m, n, n as u32));
        }
        let drained = selector.release();
        assert_eq!(drained.len(), 3);
        assert!(drained.iter().all(|f| !f.is_locked()));
        assert!(selector.is_empty());
    }
}
