use smallvec::SmallVec;
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferState};

/// Identifier of one pipeline stage (pipe).
///
/// Stage constants are declared by the pipeline layer; the core only needs
/// an ordering-stable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u16);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{}", self.0)
    }
}

/// State of one frame's visit to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Enumerated into the frame, waiting for a worker.
    Requested,
    /// A worker handed the entity to its stage.
    Processing,
    /// The stage finished; the frame is surfacing on an output queue.
    FrameDone,
    /// Visit fully accounted for.
    Complete,
    /// Recoverable stage retry; re-enters `Processing` on redispatch.
    Rework,
    /// Terminal: dropped without a valid payload.
    FrameSkip,
    /// Terminal: stage reported a hard error.
    Error,
}

impl EntityState {
    /// Terminal states count toward frame completion.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntityState::Complete | EntityState::FrameSkip | EntityState::Error
        )
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition(self, next: EntityState) -> bool {
        use EntityState::*;
        matches!(
            (self, next),
            (Requested, Processing)
                | (Processing, FrameDone)
                | (Processing, Rework)
                | (Rework, Processing)
                | (FrameDone, Complete)
                | (Requested, FrameSkip)
                | (Processing, FrameSkip)
                | (FrameDone, FrameSkip)
                | (Requested, Error)
                | (Processing, Error)
                | (FrameDone, Error)
        )
    }
}

/// One direction (src or dst) of an entity's buffer attachment.
#[derive(Debug, Clone)]
pub struct BufferSlot {
    pub buffer: Option<Buffer>,
    pub state: BufferState,
}

impl BufferSlot {
    fn empty() -> Self {
        Self {
            buffer: None,
            state: BufferState::NoRequest,
        }
    }
}

/// A frame's record of its visit to one stage.
#[derive(Debug, Clone)]
pub struct Entity {
    pub stage: StageId,
    pub state: EntityState,
    pub src: BufferSlot,
    pub dst: BufferSlot,
}

/// Per-frame shot results captured from the sensor path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DynamicMeta {
    /// Hardware frame counter, used for flash/HDR capture sync.
    pub hw_frame_count: u32,
    pub exposure_us: u64,
    pub iso: u32,
    pub ae_converged: bool,
    pub af_locked: bool,
    pub flash_fired: bool,
}

/// User/vendor metadata snapshot taken at frame creation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UserMeta {
    pub scene_mode: u32,
    pub zoom_level: u32,
    pub flash_requested: bool,
}

/// Combined metadata snapshot; captured once, then copied to auxiliary
/// frames (face-detect, preview callback) without re-acquiring from
/// hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMeta {
    pub dynamic: DynamicMeta,
    pub user: UserMeta,
    /// Whether `dynamic` was filled from a real completion.
    pub filled: bool,
}

/// What a frame is for; decides which factory topology minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Preview,
    Capture,
    Reprocessing,
    Video,
    Vision,
}

/// Per-frame participation of optional capture-side branches.
///
/// Snapshotted into the frame at creation; toggling a factory request flag
/// affects only subsequently created frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Raw bayer tap active for this frame (dynamic bayer).
    pub bayer: bool,
    /// Secondary capture-stream tap active (dynamic SCC).
    pub capture_tap: bool,
    /// Preview-callback plane requested.
    pub preview_callback: bool,
    /// Recording branch requested.
    pub video: bool,
}

/// Frame lifecycle/state errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame {frame}: stage {stage} not part of this frame")]
    UnknownStage { frame: u64, stage: StageId },
    #[error("frame {frame}: entity {stage} cannot move {from:?} -> {to:?}")]
    InvalidTransition {
        frame: u64,
        stage: StageId,
        from: EntityState,
        to: EntityState,
    },
    #[error("frame {frame}: {stage} buffer state cannot move {from:?} -> {to:?}")]
    BufferRegression {
        frame: u64,
        stage: StageId,
        from: BufferState,
        to: BufferState,
    },
    #[error("frame {0}: refcount underflow")]
    RefUnderflow(u64),
    #[error("frame {0}: still referenced ({1} refs)")]
    StillReferenced(u64, u32),
    #[error("frame {0}: locked by an in-flight list")]
    Locked(u64),
    #[error("frame {0}: not complete")]
    NotComplete(u64),
    #[error("frame manager is stopped")]
    ManagerStopped,
    #[error("frame arena exhausted")]
    ArenaFull,
    #[error("frame {0} is not registered")]
    Unknown(u64),
}

pub(crate) struct FrameInner {
    count: u64,
    kind: FrameKind,
    request: RequestFlags,
    entities: Mutex<SmallVec<[Entity; 8]>>,
    meta: Mutex<FrameMeta>,
    refs: AtomicU32,
    locked: AtomicBool,
}

impl FrameInner {
    pub(crate) fn new(
        count: u64,
        kind: FrameKind,
        request: RequestFlags,
        stages: &[StageId],
    ) -> Self {
        let entities = stages
            .iter()
            .map(|&stage| Entity {
                stage,
                state: EntityState::Requested,
                src: BufferSlot::empty(),
                dst: BufferSlot::empty(),
            })
            .collect();
        Self {
            count,
            kind,
            request,
            entities: Mutex::new(entities),
            meta: Mutex::new(FrameMeta::default()),
            refs: AtomicU32::new(1),
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub(crate) fn is_complete(&self) -> bool {
        let entities = self.entities.lock();
        !entities.is_empty() && entities.iter().all(|e| e.state.is_terminal())
    }

    pub(crate) fn dec_ref(&self) -> Result<u32, FrameError> {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.refs.store(0, Ordering::Release);
            return Err(FrameError::RefUnderflow(self.count));
        }
        Ok(prev - 1)
    }
}

/// Move-only handle to one in-flight frame.
///
/// A `Frame` cannot be cloned; transferring it between stage queues is the
/// only way to share it, which rules out the double-forward bug class by
/// construction. Entity-state transitions are the sole cross-thread-visible
/// mutation of a frame.
pub struct Frame {
    pub(crate) inner: Arc<FrameInner>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("count", &self.inner.count)
            .field("kind", &self.inner.kind)
            .field("refs", &self.inner.refs())
            .finish()
    }
}

impl Frame {
    /// Monotonic frame counter scoped to the minting factory.
    pub fn count(&self) -> u64 {
        self.inner.count
    }

    /// What this frame is for.
    pub fn kind(&self) -> FrameKind {
        self.inner.kind
    }

    /// Optional-branch participation snapshotted at creation.
    pub fn request_flags(&self) -> RequestFlags {
        self.inner.request
    }

    /// Ordered stage ids this frame visits.
    pub fn stages(&self) -> SmallVec<[StageId; 8]> {
        self.inner.entities.lock().iter().map(|e| e.stage).collect()
    }

    /// First stage of the journey.
    pub fn first_stage(&self) -> Option<StageId> {
        self.inner.entities.lock().first().map(|e| e.stage)
    }

    /// Stage following `stage` in this frame's journey.
    pub fn next_stage(&self, stage: StageId) -> Option<StageId> {
        let entities = self.inner.entities.lock();
        let pos = entities.iter().position(|e| e.stage == stage)?;
        entities.get(pos + 1).map(|e| e.stage)
    }

    /// Snapshot of one entity.
    pub fn entity(&self, stage: StageId) -> Option<Entity> {
        self.inner
            .entities
            .lock()
            .iter()
            .find(|e| e.stage == stage)
            .cloned()
    }

    /// Current state of one entity.
    pub fn entity_state(&self, stage: StageId) -> Option<EntityState> {
        self.inner
            .entities
            .lock()
            .iter()
            .find(|e| e.stage == stage)
            .map(|e| e.state)
    }

    /// Transition one entity, validating legality.
    pub fn set_entity_state(&self, stage: StageId, to: EntityState) -> Result<(), FrameError> {
        let mut entities = self.inner.entities.lock();
        let count = self.inner.count;
        let entity = entities
            .iter_mut()
            .find(|e| e.stage == stage)
            .ok_or(FrameError::UnknownStage { frame: count, stage })?;
        if !entity.state.can_transition(to) {
            return Err(FrameError::InvalidTransition {
                frame: count,
                stage,
                from: entity.state,
                to,
            });
        }
        entity.state = to;
        Ok(())
    }

    /// Attach a src buffer, moving its state to `Requested`.
    pub fn set_src_buffer(&self, stage: StageId, buffer: Buffer) -> Result<(), FrameError> {
        self.attach(stage, buffer, true)
    }

    /// Attach a dst buffer, moving its state to `Requested`.
    pub fn set_dst_buffer(&self, stage: StageId, buffer: Buffer) -> Result<(), FrameError> {
        self.attach(stage, buffer, false)
    }

    fn attach(&self, stage: StageId, buffer: Buffer, src: bool) -> Result<(), FrameError> {
        let mut entities = self.inner.entities.lock();
        let count = self.inner.count;
        let entity = entities
            .iter_mut()
            .find(|e| e.stage == stage)
            .ok_or(FrameError::UnknownStage { frame: count, stage })?;
        let slot = if src { &mut entity.src } else { &mut entity.dst };
        if !slot.state.can_advance(BufferState::Requested) {
            return Err(FrameError::BufferRegression {
                frame: count,
                stage,
                from: slot.state,
                to: BufferState::Requested,
            });
        }
        slot.buffer = Some(buffer);
        slot.state = BufferState::Requested;
        Ok(())
    }

    /// Advance a src buffer state, validating forward-only movement.
    pub fn set_src_buffer_state(
        &self,
        stage: StageId,
        to: BufferState,
    ) -> Result<(), FrameError> {
        self.advance_buffer(stage, to, true)
    }

    /// Advance a dst buffer state, validating forward-only movement.
    pub fn set_dst_buffer_state(
        &self,
        stage: StageId,
        to: BufferState,
    ) -> Result<(), FrameError> {
        self.advance_buffer(stage, to, false)
    }

    fn advance_buffer(&self, stage: StageId, to: BufferState, src: bool) -> Result<(), FrameError> {
        let mut entities = self.inner.entities.lock();
        let count = self.inner.count;
        let entity = entities
            .iter_mut()
            .find(|e| e.stage == stage)
            .ok_or(FrameError::UnknownStage { frame: count, stage })?;
        let slot = if src { &mut entity.src } else { &mut entity.dst };
        if !slot.state.can_advance(to) {
            return Err(FrameError::BufferRegression {
                frame: count,
                stage,
                from: slot.state,
                to,
            });
        }
        slot.state = to;
        Ok(())
    }

    /// Src buffer handle attached to `stage`, if any.
    pub fn src_buffer(&self, stage: StageId) -> Option<Buffer> {
        self.inner
            .entities
            .lock()
            .iter()
            .find(|e| e.stage == stage)
            .and_then(|e| e.src.buffer.clone())
    }

    /// Dst buffer handle attached to `stage`, if any.
    pub fn dst_buffer(&self, stage: StageId) -> Option<Buffer> {
        self.inner
            .entities
            .lock()
            .iter()
            .find(|e| e.stage == stage)
            .and_then(|e| e.dst.buffer.clone())
    }

    /// Detach and return the src buffer of `stage`; its state is kept.
    pub fn take_src_buffer(&self, stage: StageId) -> Option<Buffer> {
        self.inner
            .entities
            .lock()
            .iter_mut()
            .find(|e| e.stage == stage)
            .and_then(|e| e.src.buffer.take())
    }

    /// Detach and return the dst buffer of `stage`; its state is kept.
    pub fn take_dst_buffer(&self, stage: StageId) -> Option<Buffer> {
        self.inner
            .entities
            .lock()
            .iter_mut()
            .find(|e| e.stage == stage)
            .and_then(|e| e.dst.buffer.take())
    }

    /// True once every entity reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// Mark this and all not-yet-terminal downstream entities as skipped.
    ///
    /// Used by error paths so the frame still completes its lifecycle and
    /// downstream stages see the skip marker instead of a stale payload.
    pub fn skip_from(&self, stage: StageId) -> Result<(), FrameError> {
        let mut entities = self.inner.entities.lock();
        let count = self.inner.count;
        let pos = entities
            .iter()
            .position(|e| e.stage == stage)
            .ok_or(FrameError::UnknownStage { frame: count, stage })?;
        for entity in entities.iter_mut().skip(pos) {
            if !entity.state.is_terminal() {
                entity.state = EntityState::FrameSkip;
            }
        }
        Ok(())
    }

    /// Store the metadata snapshot; only the first store fills `dynamic`.
    pub fn store_meta(&self, dynamic: DynamicMeta, user: UserMeta) {
        let mut meta = self.inner.meta.lock();
        if !meta.filled {
            meta.dynamic = dynamic;
            meta.user = user;
            meta.filled = true;
        }
    }

    /// Copy this frame's metadata into `other` without re-acquiring from
    /// hardware.
    pub fn copy_meta_to(&self, other: &Frame) {
        let meta = *self.inner.meta.lock();
        let mut dst = other.inner.meta.lock();
        *dst = meta;
    }

    /// Current metadata snapshot.
    pub fn meta(&self) -> FrameMeta {
        *self.inner.meta.lock()
    }

    /// Pin the frame while a secondary in-flight list references it.
    pub fn lock(&self) {
        self.inner.locked.store(true, Ordering::Release);
    }

    /// Release the in-flight pin.
    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::Release);
    }

    /// Whether a secondary list currently pins the frame.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Take an additional reference (e.g. a post-processing list).
    pub fn inc_ref(&self) {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop an additional reference; never deletes (only the frame manager
    /// deletes).
    pub fn dec_ref(&self) -> Result<u32, FrameError> {
        self.inner.dec_ref()
    }

    /// Outstanding reference count (creation ref included).
    pub fn refs(&self) -> u32 {
        self.inner.refs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StageId = StageId(0);
    const B: StageId = StageId(1);
    const C: StageId = StageId(2);

    fn frame(stages: &[StageId]) -> Frame {
        Frame {
            inner: Arc::new(FrameInner::new(
                7,
                FrameKind::Preview,
                RequestFlags::default(),
                stages,
            )),
        }
    }

    #[test]
    fn entities_follow_declared_order() {
        let f = frame(&[A, B, C]);
        assert_eq!(f.stages().as_slice(), &[A, B, C]);
        assert_eq!(f.first_stage(), Some(A));
        assert_eq!(f.next_stage(A), Some(B));
        assert_eq!(f.next_stage(C), None);
    }

    #[test]
    fn legal_transition_chain_completes() {
        let f = frame(&[A, B]);
        for stage in [A, B] {
            f.set_entity_state(stage, EntityState::Processing).expect("processing");
            f.set_entity_state(stage, EntityState::FrameDone).expect("done");
            f.set_entity_state(stage, EntityState::Complete).expect("complete");
        }
        assert!(f.is_complete());
    }

    #[test]
    fn illegal_transition_rejected() {
        let f = frame(&[A]);
        let err = f
            .set_entity_state(A, EntityState::Complete)
            .expect_err("requested cannot jump to complete");
        assert!(matches!(err, FrameError::InvalidTransition { .. }));
    }

    #[test]
    fn rework_reenters_processing() {
        let f = frame(&[A]);
        f.set_entity_state(A, EntityState::Processing).expect("processing");
        f.set_entity_state(A, EntityState::Rework).expect("rework");
        f.set_entity_state(A, EntityState::Processing).expect("redispatch");
        f.set_entity_state(A, EntityState::FrameDone).expect("done");
        f.set_entity_state(A, EntityState::Complete).expect("complete");
        assert!(f.is_complete());
    }

    #[test]
    fn skip_from_terminates_downstream_only() {
        let f = frame(&[A, B, C]);
        f.set_entity_state(A, EntityState::Processing).expect("processing");
        f.set_entity_state(A, EntityState::FrameDone).expect("done");
        f.set_entity_state(A, EntityState::Complete).expect("complete");
        f.skip_from(B).expect("skip");
        assert_eq!(f.entity_state(A), Some(EntityState::Complete));
        assert_eq!(f.entity_state(B), Some(EntityState::FrameSkip));
        assert_eq!(f.entity_state(C), Some(EntityState::FrameSkip));
        assert!(f.is_complete());
    }

    #[test]
    fn buffer_state_forward_only() {
        let f = frame(&[A]);
        f.set_src_buffer(A, crate::buffer::Buffer::unobtained())
            .expect("attach");
        f.set_src_buffer_state(A, BufferState::Processing).expect("processing");
        f.set_src_buffer_state(A, BufferState::Complete).expect("complete");
        let err = f
            .set_src_buffer_state(A, BufferState::Processing)
            .expect_err("regression");
        assert!(matches!(err, FrameError::BufferRegression { .. }));
    }

    #[test]
    fn meta_stored_once_and_copyable() {
        let f = frame(&[A]);
        let first = DynamicMeta {
            hw_frame_count: 41,
            ..DynamicMeta::default()
        };
        f.store_meta(first, UserMeta::default());
        f.store_meta(
            DynamicMeta {
                hw_frame_count: 99,
                ..DynamicMeta::default()
            },
            UserMeta::default(),
        );
        assert_eq!(f.meta().dynamic.hw_frame_count, 41);

        let aux = frame(&[B]);
        f.copy_meta_to(&aux);
        assert_eq!(aux.meta().dynamic.hw_frame_count, 41);
        assert!(aux.meta().filled);
    }
}
