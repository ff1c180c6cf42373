//! Synthetic stage node that completes queued buffers without hardware.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use aperture_core::prelude::Buffer;

use crate::node::{ControlId, NodeCompletion, NodeError, PipeNode};

const QUEUE_DEPTH: usize = 64;

/// Stand-in for a real device node.
///
/// Completes buffers in FIFO order after an optional simulated latency, and
/// can be scripted to flag specific frame counts as bad or to report a
/// stuck data path after a number of completions.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::Buffer;
/// use aperture_pipeline::prelude::{PipeNode, VirtualNode};
/// use std::time::Duration;
///
/// let mut node = VirtualNode::new("isp");
/// node.open("virt:isp").unwrap();
/// node.start().unwrap();
/// let mut buf = Buffer::unobtained();
/// buf.index = 0;
/// node.queue_buffer(&buf, 1).unwrap();
/// let done = node.dequeue_buffer(Duration::from_millis(10)).unwrap();
/// assert!(done.ok);
/// assert_eq!(done.index, 0);
/// ```
pub struct VirtualNode {
    name: String,
    open: bool,
    started: bool,
    latency: Duration,
    fail_frames: HashSet<u64>,
    stuck_after: Option<u64>,
    completions: u64,
    hw_frame_count: u32,
    queued: ArrayQueue<(i32, u64)>,
    controls: Vec<(ControlId, i64)>,
}

impl VirtualNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open: false,
            started: false,
            latency: Duration::ZERO,
            fail_frames: HashSet::new(),
            stuck_after: None,
            completions: 0,
            hw_frame_count: 0,
            queued: ArrayQueue::new(QUEUE_DEPTH),
            controls: Vec::new(),
        }
    }

    /// Simulated per-buffer processing latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Flag these frame counts as bad completions (`ok = false`).
    pub fn with_failures(mut self, frames: &[u64]) -> Self {
        self.fail_frames = frames.iter().copied().collect();
        self
    }

    /// Report a stuck data path after `n` successful completions.
    pub fn with_stall_after(mut self, n: u64) -> Self {
        self.stuck_after = Some(n);
        self
    }

    /// Controls applied so far, oldest first.
    pub fn applied_controls(&self) -> &[(ControlId, i64)] {
        &self.controls
    }
}

impl PipeNode for VirtualNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _device: &str) -> Result<(), NodeError> {
        self.open = true;
        Ok(())
    }

    fn set_input(&mut self, _source: u32) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::NotOpen);
        }
        Ok(())
    }

    fn set_control(&mut self, id: ControlId, value: i64) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::NotOpen);
        }
        self.controls.push((id, value));
        Ok(())
    }

    fn queue_buffer(&mut self, buffer: &Buffer, frame_count: u64) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::NotOpen);
        }
        self.queued
            .push((buffer.index, frame_count))
            .map_err(|_| NodeError::Device("virtual queue overflow".into()))
    }

    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<NodeCompletion, NodeError> {
        if !self.started {
            return Err(NodeError::NotStarted);
        }
        if let Some(limit) = self.stuck_after
            && self.completions >= limit
        {
            return Err(NodeError::Stuck);
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency.min(timeout));
        }
        match self.queued.pop() {
            Some((index, frame_count)) => {
                self.completions += 1;
                self.hw_frame_count = self.hw_frame_count.wrapping_add(1);
                Ok(NodeCompletion {
                    index,
                    hw_frame_count: self.hw_frame_count,
                    ok: !self.fail_frames.contains(&frame_count),
                })
            }
            None => {
                // Nothing in flight; burn the remaining budget like a real DQ.
                thread::sleep(timeout.saturating_sub(self.latency));
                Err(NodeError::Timeout)
            }
        }
    }

    fn start(&mut self) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::NotOpen);
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        self.started = false;
        Ok(())
    }
}
