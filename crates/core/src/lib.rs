#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod counter;
pub mod frame;
pub mod frame_manager;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{
            AllocMode, Buffer, BufferError, BufferPool, BufferState, INDEX_NONE, MemoryKind,
            PlaneInfo, PoolGeometry,
        },
        counter::{ShotCounter, ShotCounterSet},
        frame::{
            BufferSlot, DynamicMeta, Entity, EntityState, Frame, FrameError, FrameKind, FrameMeta,
            RequestFlags, StageId, UserMeta,
        },
        frame_manager::{FrameCreateConfig, FrameManager},
        metrics::{Metrics, StageProgress},
        queue::{RecvOutcome, SendOutcome, StageRx, StageTx, stage_queue, stage_queue_bounded},
    };
}
