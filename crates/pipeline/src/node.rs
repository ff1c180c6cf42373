use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use aperture_core::prelude::Buffer;

/// Scalar runtime control knob on a stage node (target FPS, scene mode,
/// DVFS hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlId(pub u32);

pub const CTRL_TARGET_FPS: ControlId = ControlId(1);
pub const CTRL_SCENE_MODE: ControlId = ControlId(2);
pub const CTRL_DVFS_HINT: ControlId = ControlId(3);

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctrl{}", self.0)
    }
}

/// Completion record returned by a node dequeue.
#[derive(Debug, Clone, Copy)]
pub struct NodeCompletion {
    /// Buffer index the hardware finished with.
    pub index: i32,
    /// Hardware frame counter at completion; used for flash/HDR capture
    /// sync.
    pub hw_frame_count: u32,
    /// False when the device flagged the payload as bad.
    pub ok: bool,
}

/// Errors from the stage hardware/software collaborator.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node not open")]
    NotOpen,
    #[error("node not started")]
    NotStarted,
    #[error("dequeue timed out")]
    Timeout,
    #[error("device stuck / data path overflow")]
    Stuck,
    #[error("device error: {0}")]
    Device(String),
}

impl NodeError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::NotOpen => "not_open",
            NodeError::NotStarted => "not_started",
            NodeError::Timeout => "timeout",
            NodeError::Stuck => "stuck",
            NodeError::Device(_) => "device_error",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, NodeError::Timeout)
    }
}

/// Contract with one pipeline stage's hardware or software processing unit.
///
/// Every call is treated as potentially slow/blocking; the engine only ever
/// drives a node from a stage worker thread, never from the session
/// controller's own thread.
pub trait PipeNode: Send {
    fn name(&self) -> &str;

    /// Open the underlying device/resource.
    fn open(&mut self, device: &str) -> Result<(), NodeError>;

    /// Wire the upstream source for OTF-linked stages.
    fn set_input(&mut self, source: u32) -> Result<(), NodeError>;

    /// Apply a scalar runtime control.
    fn set_control(&mut self, id: ControlId, value: i64) -> Result<(), NodeError>;

    /// Hand a buffer to the stage for processing.
    fn queue_buffer(&mut self, buffer: &Buffer, frame_count: u64) -> Result<(), NodeError>;

    /// Wait up to `timeout` for the stage to finish with a buffer.
    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<NodeCompletion, NodeError>;

    /// Start consuming queued buffers.
    fn start(&mut self) -> Result<(), NodeError>;

    /// Reject new work and unblock a pending dequeue.
    fn stop(&mut self) -> Result<(), NodeError>;
}

/// A node shared between the factory (controls) and its worker (data path).
///
/// The mutex is the serialization point; neither side holds it across a
/// blocking wait longer than the node's own dequeue timeout.
pub type SharedNode = Arc<Mutex<Box<dyn PipeNode>>>;

/// Wrap a node for shared factory/worker access.
pub fn share(node: Box<dyn PipeNode>) -> SharedNode {
    Arc::new(Mutex::new(node))
}
