use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::frame::{Frame, FrameError, FrameInner, FrameKind, RequestFlags, StageId};

/// Everything a factory passes when minting a frame.
#[derive(Debug, Clone)]
pub struct FrameCreateConfig {
    pub kind: FrameKind,
    pub request: RequestFlags,
    pub stages: SmallVec<[StageId; 8]>,
}

struct Arena {
    slots: Vec<Option<Arc<FrameInner>>>,
    free: Vec<usize>,
    by_count: HashMap<u64, usize>,
}

/// Sole authority for frame creation and destruction.
///
/// Frames live in a fixed-capacity arena of recyclable slots; the arena
/// doubles as the in-flight registry, so "is this frame still known"
/// lookups and leak accounting happen in one place.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::*;
/// use smallvec::smallvec;
///
/// let manager = FrameManager::new("preview", 8);
/// manager.start();
/// let config = FrameCreateConfig {
///     kind: FrameKind::Preview,
///     request: RequestFlags::default(),
///     stages: smallvec![StageId(0)],
/// };
/// let frame = manager.create_frame(&config, 1).expect("create");
/// frame.set_entity_state(StageId(0), EntityState::Processing).unwrap();
/// frame.set_entity_state(StageId(0), EntityState::FrameDone).unwrap();
/// frame.set_entity_state(StageId(0), EntityState::Complete).unwrap();
/// manager.delete_frame(frame).expect("delete");
/// assert_eq!(manager.in_flight(), 0);
/// ```
pub struct FrameManager {
    name: String,
    running: AtomicBool,
    arena: Mutex<Arena>,
    created: AtomicU64,
    deleted: AtomicU64,
}

impl FrameManager {
    /// Create a manager with a fixed arena capacity.
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(false),
            arena: Mutex::new(Arena {
                slots: (0..capacity).map(|_| None).collect(),
                free: (0..capacity).rev().collect(),
                by_count: HashMap::new(),
            }),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    /// Enable minting. Idempotent.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Disable minting. Idempotent and safe while frames are in flight;
    /// existing frames are untouched.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether minting is enabled.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mint a frame stamped with `count`, refcount 1.
    ///
    /// Returns `None` when stopped or when the arena is exhausted; callers
    /// treat this as fatal to the operation in progress, not the process.
    pub fn create_frame(&self, config: &FrameCreateConfig, count: u64) -> Option<Frame> {
        if !self.running() {
            log::warn!("frame manager {}: create while stopped", self.name);
            return None;
        }
        let mut arena = self.arena.lock();
        if arena.by_count.contains_key(&count) {
            log::error!("frame manager {}: duplicate frame count {}", self.name, count);
            return None;
        }
        let Some(slot) = arena.free.pop() else {
            log::error!(
                "frame manager {}: arena exhausted ({} in flight)",
                self.name,
                arena.by_count.len()
            );
            return None;
        };
        let inner = Arc::new(FrameInner::new(
            count,
            config.kind,
            config.request,
            &config.stages,
        ));
        arena.slots[slot] = Some(inner.clone());
        arena.by_count.insert(count, slot);
        self.created.fetch_add(1, Ordering::Relaxed);
        Some(Frame { inner })
    }

    /// Destroy a frame, recycling its arena slot.
    ///
    /// Requires the creation ref to be the last one, every entity terminal,
    /// and no in-flight lock. Violations are logged loudly and rejected so
    /// leaks surface in accounting instead of turning into use-after-free.
    pub fn delete_frame(&self, frame: Frame) -> Result<(), FrameError> {
        let count = frame.count();
        if frame.is_locked() {
            log::error!("frame manager {}: delete of locked frame {}", self.name, count);
            return Err(FrameError::Locked(count));
        }
        let refs = frame.refs();
        if refs > 1 {
            log::error!(
                "frame manager {}: delete of frame {} with {} refs",
                self.name,
                count,
                refs
            );
            return Err(FrameError::StillReferenced(count, refs));
        }
        if !frame.is_complete() {
            return Err(FrameError::NotComplete(count));
        }
        let mut arena = self.arena.lock();
        let slot = arena
            .by_count
            .remove(&count)
            .ok_or(FrameError::Unknown(count))?;
        frame.dec_ref()?;
        arena.slots[slot] = None;
        arena.free.push(slot);
        self.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether `count` is still registered (in flight).
    pub fn is_known(&self, count: u64) -> bool {
        self.arena.lock().by_count.contains_key(&count)
    }

    /// Frames currently in flight.
    pub fn in_flight(&self) -> usize {
        self.arena.lock().by_count.len()
    }

    /// Lifetime created counter (leak detection).
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Lifetime deleted counter (leak detection).
    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EntityState;
    use smallvec::smallvec;

    const A: StageId = StageId(0);
    const B: StageId = StageId(1);

    fn config() -> FrameCreateConfig {
        FrameCreateConfig {
            kind: FrameKind::Preview,
            request: RequestFlags::default(),
            stages: smallvec![A, B],
        }
    }

    fn complete(frame: &Frame) {
        for stage in [A, B] {
            frame.set_entity_state(stage, EntityState::Processing).expect("processing");
            frame.set_entity_state(stage, EntityState::FrameDone).expect("done");
            frame.set_entity_state(stage, EntityState::Complete).expect("complete");
        }
    }

    #[test]
    fn stopped_manager_mints_nothing() {
        let manager = FrameManager::new("t", 4);
        assert!(manager.create_frame(&config(), 1).is_none());
        manager.start();
        assert!(manager.create_frame(&config(), 1).is_some());
    }

    #[test]
    fn delete_requires_completion() {
        let manager = FrameManager::new("t", 4);
        manager.start();
        let frame = manager.create_frame(&config(), 1).expect("create");
        let err = manager.delete_frame(frame).expect_err("incomplete");
        assert!(matches!(err, FrameError::NotComplete(1)));
    }

    #[test]
    fn delete_rejects_extra_refs_and_lock() {
        let manager = FrameManager::new("t", 4);
        manager.start();

        let frame = manager.create_frame(&config(), 1).expect("create");
        complete(&frame);
        frame.inc_ref();
        let err = manager.delete_frame(frame).expect_err("referenced");
        let FrameError::StillReferenced(1, 2) = err else {
            panic!("unexpected error {err:?}");
        };

        let frame = manager.create_frame(&config(), 2).expect("create");
        complete(&frame);
        frame.lock();
        let err = manager.delete_frame(frame).expect_err("locked");
        assert!(matches!(err, FrameError::Locked(2)));
    }

    #[test]
    fn arena_recycles_and_accounts_exactly_once() {
        let manager = FrameManager::new("t", 2);
        manager.start();
        // N capture cycles through a 2-slot arena: every created frame is
        // deleted exactly once and slots recycle.
        for cycle in 0..20u64 {
            let frame = manager.create_frame(&config(), cycle).expect("create");
            complete(&frame);
            manager.delete_frame(frame).expect("delete");
        }
        assert_eq!(manager.created(), 20);
        assert_eq!(manager.deleted(), 20);
        assert_eq!(manager.in_flight(), 0);
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let manager = FrameManager::new("t", 1);
        manager.start();
        let held = manager.create_frame(&config(), 1).expect("create");
        assert!(manager.create_frame(&config(), 2).is_none());
        complete(&held);
        manager.delete_frame(held).expect("delete");
        assert!(manager.create_frame(&config(), 2).is_some());
    }

    #[test]
    fn stop_leaves_in_flight_frames_alone() {
        let manager = FrameManager::new("t", 4);
        manager.start();
        let frame = manager.create_frame(&config(), 5).expect("create");
        manager.stop();
        manager.stop();
        assert!(manager.is_known(5));
        complete(&frame);
        manager.delete_frame(frame).expect("delete after stop");
    }
}
