use smallvec::SmallVec;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics::Metrics;

/// Sentinel index meaning "no buffer obtained yet".
pub const INDEX_NONE: i32 = -2;

/// Per-direction buffer state for one frame's visit to one stage.
///
/// Transitions are strictly forward; `Error` sends the buffer back to its
/// pool via `cancel_buffer`, never downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Stage direction not requested for this frame.
    NoRequest,
    /// Buffer obtained from the pool, not yet handed to the stage.
    Requested,
    /// Stage is working on the buffer.
    Processing,
    /// Stage finished with the buffer.
    Complete,
    /// Stage reported a hardware/software error.
    Error,
}

impl BufferState {
    /// Whether moving to `next` is a legal forward transition.
    pub fn can_advance(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (NoRequest, Requested)
                | (Requested, Processing)
                | (Processing, Complete)
                | (Requested, Error)
                | (Processing, Error)
        )
    }

    /// Terminal states never advance again within one visit.
    pub fn is_terminal(self) -> bool {
        matches!(self, BufferState::Complete | BufferState::Error)
    }
}

/// Size and stride of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub size: usize,
    pub stride: usize,
}

/// Handle to a pooled buffer.
///
/// The handle is plain data; ownership is tracked by the pool's slot table,
/// keyed by `index`, and verified by the exclusivity tests rather than by
/// the handle itself.
#[derive(Debug, Clone)]
pub struct Buffer {
    /// Pool slot index, or [`INDEX_NONE`] before a get.
    pub index: i32,
    /// Pool generation this handle belongs to; stale handles are rejected.
    pub generation: u64,
    /// Plane geometry copied from the pool at get time.
    pub planes: SmallVec<[PlaneInfo; 4]>,
    /// Whether a trailing metadata plane is attached.
    pub has_meta_plane: bool,
    /// Stage whose pool this buffer came from; set by the worker that
    /// obtained it so any later holder can route the release.
    pub tag: Option<crate::frame::StageId>,
}

impl Buffer {
    /// A handle that has not been obtained from any pool.
    pub fn unobtained() -> Self {
        Self {
            index: INDEX_NONE,
            generation: 0,
            planes: SmallVec::new(),
            has_meta_plane: false,
            tag: None,
        }
    }

    /// Whether this handle refers to a real pool slot.
    pub fn is_obtained(&self) -> bool {
        self.index >= 0
    }
}

/// When buffers are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Allocate the full `max_count` during `alloc()`.
    AtOnce,
    /// Allocate `min_count` during `alloc()`, grow lazily to `max_count`.
    OnDemand,
}

/// Memory backing requested from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Cached,
    NonCached,
    Reserved,
}

/// Fixed plane geometry and sizing for one pool.
#[derive(Debug, Clone)]
pub struct PoolGeometry {
    pub plane_count: usize,
    pub plane_sizes: SmallVec<[usize; 4]>,
    pub strides: SmallVec<[usize; 4]>,
    pub min_count: usize,
    pub max_count: usize,
    pub alloc_mode: AllocMode,
    pub memory: MemoryKind,
    pub needs_meta_plane: bool,
    pub needs_mapping: bool,
}

impl PoolGeometry {
    /// Convenience constructor for a single-plane pool.
    pub fn single_plane(size: usize, stride: usize, count: usize) -> Self {
        Self {
            plane_count: 1,
            plane_sizes: smallvec::smallvec![size],
            strides: smallvec::smallvec![stride],
            min_count: count,
            max_count: count,
            alloc_mode: AllocMode::AtOnce,
            memory: MemoryKind::Cached,
            needs_meta_plane: false,
            needs_mapping: false,
        }
    }

    fn validate(&self) -> Result<(), BufferError> {
        if self.plane_count == 0
            || self.plane_sizes.len() != self.plane_count
            || self.strides.len() != self.plane_count
        {
            return Err(BufferError::InvalidGeometry);
        }
        if self.min_count == 0 || self.max_count < self.min_count {
            return Err(BufferError::InvalidGeometry);
        }
        Ok(())
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("pool not configured; call set_info() then alloc()")]
    NotConfigured,
    #[error("pool already allocated; deinit() before reconfiguring")]
    AlreadyAllocated,
    #[error("geometry rejected")]
    InvalidGeometry,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("no free buffer available")]
    Exhausted,
    #[error("index {0} out of range for pool")]
    InvalidIndex(i32),
    #[error("index {0} belongs to a previous pool generation")]
    StaleGeneration(i32),
    #[error("index {0} released while already free")]
    DoubleRelease(i32),
}

impl BufferError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::NotConfigured => "not_configured",
            BufferError::AlreadyAllocated => "already_allocated",
            BufferError::InvalidGeometry => "invalid_geometry",
            BufferError::AllocationFailed => "allocation_failed",
            BufferError::Exhausted => "exhausted",
            BufferError::InvalidIndex(_) => "invalid_index",
            BufferError::StaleGeneration(_) => "stale_generation",
            BufferError::DoubleRelease(_) => "double_release",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, BufferError::Exhausted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Owned { frame: u64 },
}

#[derive(Default)]
struct PoolCycles {
    gets: u64,
    puts: u64,
    cancels: u64,
}

struct PoolState {
    geometry: Option<PoolGeometry>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    generation: u64,
    cycles: PoolCycles,
}

/// Fixed-capacity pool of hardware-mappable buffers for one pipeline stage.
///
/// Invariants enforced here: a slot index is owned by at most one frame at a
/// time, and the free count stays consistent with outstanding gets/puts.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{BufferPool, PoolGeometry};
///
/// let pool = BufferPool::new("bayer");
/// pool.set_info(PoolGeometry::single_plane(1024, 1024, 4)).unwrap();
/// pool.alloc().unwrap();
/// let buf = pool.get_buffer(1).unwrap();
/// assert!(buf.is_obtained());
/// pool.put_buffer(buf.index).unwrap();
/// assert_eq!(pool.available(), 4);
/// ```
pub struct BufferPool {
    name: String,
    state: Mutex<PoolState>,
    metrics: Arc<Metrics>,
}

impl BufferPool {
    /// Create an unconfigured pool with a diagnostic name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(PoolState {
                geometry: None,
                slots: Vec::new(),
                free: Vec::new(),
                generation: 0,
                cycles: PoolCycles::default(),
            }),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Diagnostic name for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record plane geometry and sizing. Must precede `alloc()`; rejected
    /// while an allocation is live.
    pub fn set_info(&self, geometry: PoolGeometry) -> Result<(), BufferError> {
        geometry.validate()?;
        let mut state = self.state.lock();
        if !state.slots.is_empty() {
            return Err(BufferError::AlreadyAllocated);
        }
        state.geometry = Some(geometry);
        Ok(())
    }

    /// Materialize buffers according to the configured geometry.
    ///
    /// `AtOnce` creates `max_count` slots now; `OnDemand` creates
    /// `min_count` and grows lazily in `get_buffer` up to `max_count`.
    pub fn alloc(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if !state.slots.is_empty() {
            return Err(BufferError::AlreadyAllocated);
        }
        let geometry = state.geometry.clone().ok_or(BufferError::NotConfigured)?;
        let initial = match geometry.alloc_mode {
            AllocMode::AtOnce => geometry.max_count,
            AllocMode::OnDemand => geometry.min_count,
        };
        for idx in 0..initial {
            state.slots.push(Slot::Free);
            state.free.push(idx);
            self.metrics.alloc();
        }
        log::debug!(
            "pool {}: allocated {} of max {} buffers",
            self.name,
            initial,
            geometry.max_count
        );
        Ok(())
    }

    /// Obtain a free buffer for `frame`.
    ///
    /// Returns `Exhausted` when nothing is free; callers apply their own
    /// bounded retry/backoff budget.
    pub fn get_buffer(&self, frame: u64) -> Result<Buffer, BufferError> {
        let mut state = self.state.lock();
        let geometry = state.geometry.clone().ok_or(BufferError::NotConfigured)?;
        if state.slots.is_empty() {
            return Err(BufferError::NotConfigured);
        }
        let idx = match state.free.pop() {
            Some(idx) => {
                self.metrics.hit();
                idx
            }
            None if state.slots.len() < geometry.max_count
                && geometry.alloc_mode == AllocMode::OnDemand =>
            {
                // Lazy growth path.
                let idx = state.slots.len();
                state.slots.push(Slot::Free);
                self.metrics.miss();
                self.metrics.alloc();
                idx
            }
            None => {
                self.metrics.backpressure();
                return Err(BufferError::Exhausted);
            }
        };
        state.slots[idx] = Slot::Owned { frame };
        state.cycles.gets += 1;
        let planes = geometry
            .plane_sizes
            .iter()
            .zip(geometry.strides.iter())
            .map(|(&size, &stride)| PlaneInfo { size, stride })
            .collect();
        Ok(Buffer {
            index: idx as i32,
            generation: state.generation,
            planes,
            has_meta_plane: geometry.needs_meta_plane,
            tag: None,
        })
    }

    /// Return a productively used buffer to the pool.
    ///
    /// Double release is a caller bug; it is reported, logged, and the slot
    /// is left untouched.
    pub fn put_buffer(&self, index: i32) -> Result<(), BufferError> {
        self.release(index, false)
    }

    /// Return a buffer that was obtained but never productively filled
    /// (dropped/skipped frame). Kept distinct from `put_buffer` so usage
    /// accounting stays correct.
    pub fn cancel_buffer(&self, index: i32) -> Result<(), BufferError> {
        self.release(index, true)
    }

    fn release(&self, index: i32, cancelled: bool) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if index < 0 || index as usize >= state.slots.len() {
            return Err(BufferError::InvalidIndex(index));
        }
        let idx = index as usize;
        match state.slots[idx] {
            Slot::Free => {
                log::error!(
                    "pool {}: double release of index {} (cancelled={})",
                    self.name,
                    index,
                    cancelled
                );
                Err(BufferError::DoubleRelease(index))
            }
            Slot::Owned { .. } => {
                state.slots[idx] = Slot::Free;
                state.free.push(idx);
                if cancelled {
                    state.cycles.cancels += 1;
                } else {
                    state.cycles.puts += 1;
                }
                Ok(())
            }
        }
    }

    /// Validate that `buffer` belongs to this pool's live generation.
    pub fn check_generation(&self, buffer: &Buffer) -> Result<(), BufferError> {
        let state = self.state.lock();
        if buffer.generation != state.generation {
            return Err(BufferError::StaleGeneration(buffer.index));
        }
        Ok(())
    }

    /// Return every buffer to the free state, keeping the allocation.
    ///
    /// Used between preview restarts when geometry is unchanged. All
    /// outstanding handles become invalid; callers must not hold any.
    pub fn reset_buffers(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if state.slots.is_empty() {
            return Err(BufferError::NotConfigured);
        }
        let owned = state.slots.iter().filter(|s| **s != Slot::Free).count();
        if owned > 0 {
            log::warn!("pool {}: reset with {} buffers still owned", self.name, owned);
        }
        state.free.clear();
        for idx in 0..state.slots.len() {
            state.slots[idx] = Slot::Free;
            state.free.push(idx);
        }
        Ok(())
    }

    /// Free the allocation entirely; required before changing geometry.
    ///
    /// Bumps the pool generation so handles from the old allocation are
    /// rejected rather than silently reused.
    pub fn deinit(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        state.slots.clear();
        state.free.clear();
        state.geometry = None;
        state.generation += 1;
        state.cycles = PoolCycles::default();
        Ok(())
    }

    /// Free buffers right now.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Buffers materialized so far.
    pub fn allocated(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whether a get would currently fail (ignoring on-demand growth).
    pub fn is_exhausted(&self) -> bool {
        self.available() == 0
    }

    /// Frame currently owning `index`, if any.
    pub fn owner_of(&self, index: i32) -> Option<u64> {
        let state = self.state.lock();
        if index < 0 || index as usize >= state.slots.len() {
            return None;
        }
        match state.slots[index as usize] {
            Slot::Owned { frame } => Some(frame),
            Slot::Free => None,
        }
    }

    /// Lifetime (gets, puts, cancels) counters.
    pub fn cycles(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (
            state.cycles.gets,
            state.cycles.puts,
            state.cycles.cancels,
        )
    }

    /// Configured geometry, if any.
    pub fn geometry(&self) -> Option<PoolGeometry> {
        self.state.lock().geometry.clone()
    }

    /// Backpressure/allocation counters for this pool.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool_with(count: usize) -> BufferPool {
        let pool = BufferPool::new("test");
        pool.set_info(PoolGeometry::single_plane(4096, 4096, count))
            .expect("set_info");
        pool.alloc().expect("alloc");
        pool
    }

    #[test]
    fn get_put_roundtrip_restores_availability() {
        let pool = pool_with(3);
        let a = pool.get_buffer(1).expect("get");
        let b = pool.get_buffer(2).expect("get");
        assert_eq!(pool.available(), 1);
        pool.put_buffer(a.index).expect("put");
        pool.put_buffer(b.index).expect("put");
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn exhaustion_is_retryable_backpressure() {
        let pool = pool_with(1);
        let held = pool.get_buffer(1).expect("get");
        let err = pool.get_buffer(2).expect_err("exhausted");
        assert!(matches!(err, BufferError::Exhausted));
        assert!(err.retryable());
        pool.put_buffer(held.index).expect("put");
        assert!(pool.get_buffer(2).is_ok());
    }

    #[test]
    fn double_put_detected_not_masked() {
        let pool = pool_with(2);
        let buf = pool.get_buffer(1).expect("get");
        pool.put_buffer(buf.index).expect("first put");
        let err = pool.put_buffer(buf.index).expect_err("double put");
        assert!(matches!(err, BufferError::DoubleRelease(_)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn cancel_keeps_usage_accounting_distinct() {
        let pool = pool_with(2);
        let used = pool.get_buffer(1).expect("get");
        let dropped = pool.get_buffer(2).expect("get");
        pool.put_buffer(used.index).expect("put");
        pool.cancel_buffer(dropped.index).expect("cancel");
        let (gets, puts, cancels) = pool.cycles();
        assert_eq!((gets, puts, cancels), (2, 1, 1));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn on_demand_grows_to_max_only() {
        let pool = BufferPool::new("ondemand");
        let mut geometry = PoolGeometry::single_plane(64, 64, 1);
        geometry.min_count = 1;
        geometry.max_count = 3;
        geometry.alloc_mode = AllocMode::OnDemand;
        pool.set_info(geometry).expect("set_info");
        pool.alloc().expect("alloc");
        assert_eq!(pool.allocated(), 1);
        let _a = pool.get_buffer(1).expect("get");
        let _b = pool.get_buffer(2).expect("grow");
        let _c = pool.get_buffer(3).expect("grow");
        assert_eq!(pool.allocated(), 3);
        assert!(matches!(
            pool.get_buffer(4),
            Err(BufferError::Exhausted)
        ));
    }

    #[test]
    fn reconfigure_requires_deinit_and_bumps_generation() {
        let pool = pool_with(2);
        let stale = pool.get_buffer(1).expect("get");
        assert!(matches!(
            pool.set_info(PoolGeometry::single_plane(128, 128, 2)),
            Err(BufferError::AlreadyAllocated)
        ));
        pool.deinit().expect("deinit");
        pool.set_info(PoolGeometry::single_plane(128, 128, 5))
            .expect("set_info after deinit");
        pool.alloc().expect("alloc");
        assert_eq!(pool.available(), 5);
        // A handle from the old allocation is rejected, not recycled.
        assert!(matches!(
            pool.check_generation(&stale),
            Err(BufferError::StaleGeneration(_))
        ));
    }

    #[test]
    fn reset_keeps_allocation() {
        let pool = pool_with(4);
        let _a = pool.get_buffer(1).expect("get");
        let _b = pool.get_buffer(2).expect("get");
        pool.reset_buffers().expect("reset");
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.allocated(), 4);
    }

    // Property drive: random get/put/cancel sequences never yield one index
    // owned by two frames at once.
    #[test]
    fn ownership_exclusive_under_random_churn() {
        let pool = pool_with(4);
        let mut held: HashMap<i32, u64> = HashMap::new();
        let mut seed = 0x9e3779b9u64;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };
        for step in 0..2000u64 {
            match next() % 3 {
                0 => {
                    if let Ok(buf) = pool.get_buffer(step) {
                        // The slot must not already be held by a live frame.
                        assert!(
                            !held.contains_key(&buf.index),
                            "index {} handed out twice",
                            buf.index
                        );
                        held.insert(buf.index, step);
                    }
                }
                1 => {
                    if let Some((&idx, _)) = held.iter().next() {
                        held.remove(&idx);
                        pool.put_buffer(idx).expect("put");
                    }
                }
                _ => {
                    if let Some((&idx, _)) = held.iter().next() {
                        held.remove(&idx);
                        pool.cancel_buffer(idx).expect("cancel");
                    }
                }
            }
            for (&idx, &frame) in &held {
                assert_eq!(pool.owner_of(idx), Some(frame));
            }
        }
        for (idx, _) in held.drain() {
            pool.put_buffer(idx).expect("final put");
        }
        assert_eq!(pool.available(), 4);
    }
}
