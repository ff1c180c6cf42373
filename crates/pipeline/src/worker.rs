use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aperture_core::prelude::{
    Buffer, BufferError, BufferPool, BufferState, DynamicMeta, EntityState, Frame, RecvOutcome,
    StageId, StageProgress, StageRx, StageTx, UserMeta,
};

use crate::node::{NodeError, SharedNode};
use crate::selector::CaptureSelector;
use crate::topology::StageDescriptor;

/// Bounded retry policy for buffer-pool exhaustion and node dequeue
/// timeouts: `attempts * backoff` is the total wait budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        // A few hundred milliseconds total, per the backpressure policy.
        Self {
            attempts: 10,
            backoff: Duration::from_millis(30),
        }
    }
}

/// Receiver of frames whose journey ended.
///
/// The sink owns buffer release and frame deletion; it is called from the
/// worker's own stack after the frame reached a fully terminal state, so a
/// cancellation can never free a frame another thread is transitioning.
pub trait CompletionSink: Send + Sync {
    /// Journey finished with a valid payload.
    fn on_frame_done(&self, frame: Frame);
    /// Journey ended via skip/error; payload must not be trusted.
    fn on_frame_skip(&self, frame: Frame);
}

/// Frozen queue wiring shared by all workers of one factory.
pub struct Wiring {
    /// Chain-head stage -> that chain's input queue.
    pub routes: HashMap<StageId, StageTx<Frame>>,
    /// Chain-tail stage -> output queue (frame surfaces with the tail
    /// entity at `FrameDone`; the consumer completes and routes it).
    pub outputs: HashMap<StageId, StageTx<Frame>>,
    /// Chain-head stage -> done queue for OTF chains whose handoff is
    /// absorbed internally.
    pub done: HashMap<StageId, StageTx<Frame>>,
    /// Chain-tail stage -> selector hold list intercepting still-capture
    /// candidates.
    pub selectors: HashMap<StageId, Arc<CaptureSelector>>,
}

/// Everything one chain worker needs at runtime.
pub struct ChainRuntime {
    pub chain: Vec<StageDescriptor>,
    pub input: StageRx<Frame>,
    pub nodes: HashMap<StageId, SharedNode>,
    /// Every pool of the factory, keyed by the stage that fills it.
    pub pools: Arc<HashMap<StageId, Arc<BufferPool>>>,
    pub wiring: Arc<Wiring>,
    pub sink: Arc<dyn CompletionSink>,
    pub stop: Arc<AtomicBool>,
    pub progress: StageProgress,
    pub budget: RetryBudget,
}

enum StageFailure {
    PoolExhausted,
    Node(NodeError),
    BadPayload,
    State,
}

/// One running chain worker thread.
pub struct StageWorker {
    name: String,
    input: StageRx<Frame>,
    handle: Option<JoinHandle<()>>,
}

impl StageWorker {
    /// Spawn the worker loop for one chain.
    pub fn spawn(name: &str, runtime: ChainRuntime) -> Self {
        let input = runtime.input.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run(runtime))
            .ok();
        if handle.is_none() {
            log::error!("worker {name}: spawn failed");
        }
        Self {
            name: thread_name,
            input,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unblock a pending queue wait so the stop flag gets polled.
    pub fn wake(&self) {
        self.input.wake();
    }

    /// Join the worker; the stop signal must already be raised.
    pub fn join(mut self) {
        self.input.wake();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("worker {}: panicked", self.name);
        }
    }
}

fn run(rt: ChainRuntime) {
    let head = rt.chain.first().map(|d| d.name).unwrap_or("?");
    log::debug!("worker {head}: running");
    loop {
        if rt.stop.load(Ordering::Acquire) {
            break;
        }
        // Renewed every iteration: the monitor flags a worker that stops
        // coming back here, i.e. one stuck inside a stage dispatch.
        rt.progress.renew();
        match rt.input.recv_wait() {
            RecvOutcome::Data(frame) => {
                process_frame(&rt, frame);
            }
            RecvOutcome::Empty => {
                log::trace!("worker {head}: input wait elapsed");
            }
            RecvOutcome::Closed => break,
        }
    }
    log::debug!("worker {head}: exiting");
}

fn process_frame(rt: &ChainRuntime, frame: Frame) {
    // Snapshot the stages of this chain the frame actually carries and has
    // not already resolved (skip markers pass through untouched).
    let pending: Vec<StageDescriptor> = rt
        .chain
        .iter()
        .filter(|d| {
            frame
                .entity_state(d.id)
                .is_some_and(|s| !s.is_terminal())
        })
        .copied()
        .collect();
    let Some(tail) = pending.last().map(|d| d.id) else {
        route_onward(rt, frame, None);
        return;
    };

    for desc in &pending {
        let stage = desc.id;
        if let Err(failure) = drive_stage(rt, &frame, desc) {
            fail_stage(rt, frame, stage, failure);
            return;
        }
        if stage != tail {
            if frame.set_entity_state(stage, EntityState::Complete).is_err() {
                fail_stage(rt, frame, stage, StageFailure::State);
                return;
            }
            continue;
        }
        // Tail: decide where the frame surfaces.
        if let Some(out) = rt.wiring.outputs.get(&stage) {
            // Leave the tail at FrameDone; the consumer completes it.
            if let Err((frame, outcome)) = out.send_or_return(frame) {
                log::warn!("worker: output queue for {stage} rejected frame ({outcome:?})");
                resolve_unroutable(rt, frame);
            }
            return;
        }
        let head = rt.chain.first().map(|d| d.id);
        if let Some(doneq) = head.and_then(|h| rt.wiring.done.get(&h)) {
            if let Err((frame, outcome)) = doneq.send_or_return(frame) {
                log::warn!("worker: done queue for {stage} rejected frame ({outcome:?})");
                resolve_unroutable(rt, frame);
            }
            return;
        }
        if let Some(selector) = rt.wiring.selectors.get(&stage) {
            if frame.set_entity_state(stage, EntityState::Complete).is_err() {
                fail_stage(rt, frame, stage, StageFailure::State);
                return;
            }
            for evicted in selector.manage_frame_hold_list(frame) {
                rt.sink.on_frame_done(evicted);
            }
            return;
        }
        if frame.set_entity_state(stage, EntityState::Complete).is_err() {
            fail_stage(rt, frame, stage, StageFailure::State);
            return;
        }
        route_onward(rt, frame, Some(stage));
        return;
    }
}

/// Forward a frame past `after` (or past this chain entirely for a
/// pass-through) to the chain owning its next pending stage, or finish it.
fn route_onward(rt: &ChainRuntime, frame: Frame, after: Option<StageId>) {
    let next = match after {
        Some(stage) => next_pending(&frame, stage),
        None => first_pending(&frame),
    };
    match next {
        Some(next) => {
            // M2M handoff: the processed dst becomes the successor's src.
            if let Some(stage) = after
                && let Some(dst) = frame.take_dst_buffer(stage)
                && frame.set_src_buffer(next, dst).is_err()
            {
                log::error!(
                    "worker: frame {} src attach for {next} rejected",
                    frame.count()
                );
            }
            let Some(route) = rt.wiring.routes.get(&next) else {
                log::error!("worker: no route to {next}; skipping frame {}", frame.count());
                let _ = frame.skip_from(next);
                rt.sink.on_frame_skip(frame);
                return;
            };
            if let Err((frame, outcome)) = route.send_or_return(frame) {
                log::warn!("worker: route to {next} rejected frame ({outcome:?})");
                resolve_unroutable(rt, frame);
            }
        }
        None => {
            if frame.is_complete() {
                rt.sink.on_frame_done(frame);
            } else {
                // Nothing left to run but not complete: resolve as skip.
                if let Some(first) = first_pending(&frame) {
                    let _ = frame.skip_from(first);
                }
                rt.sink.on_frame_skip(frame);
            }
        }
    }
}

/// A frame nobody can accept (queue closed during teardown) still finishes
/// its lifecycle through the sink.
fn resolve_unroutable(rt: &ChainRuntime, frame: Frame) {
    if let Some(first) = first_pending(&frame) {
        let _ = frame.skip_from(first);
    }
    rt.sink.on_frame_skip(frame);
}

fn first_pending(frame: &Frame) -> Option<StageId> {
    frame
        .stages()
        .into_iter()
        .find(|&s| frame.entity_state(s).is_some_and(|st| !st.is_terminal()))
}

fn next_pending(frame: &Frame, after: StageId) -> Option<StageId> {
    let stages = frame.stages();
    let pos = stages.iter().position(|&s| s == after)?;
    stages[pos + 1..]
        .iter()
        .copied()
        .find(|&s| frame.entity_state(s).is_some_and(|st| !st.is_terminal()))
}

fn drive_stage(
    rt: &ChainRuntime,
    frame: &Frame,
    desc: &StageDescriptor,
) -> Result<(), StageFailure> {
    let stage = desc.id;
    frame
        .set_entity_state(stage, EntityState::Processing)
        .map_err(|_| StageFailure::State)?;

    // Attach a dst buffer when this stage fills one, with bounded retry on
    // exhaustion; this wait is the pipeline's flow control.
    let dst = match rt.pools.get(&stage) {
        Some(pool) => Some(obtain_with_budget(pool, frame.count(), stage, &rt.budget)?),
        None => None,
    };
    if let Some(buf) = &dst {
        frame
            .set_dst_buffer(stage, buf.clone())
            .and_then(|_| frame.set_dst_buffer_state(stage, BufferState::Processing))
            .map_err(|_| StageFailure::State)?;
    }
    let src = frame.src_buffer(stage);
    if src.is_some() {
        frame
            .set_src_buffer_state(stage, BufferState::Processing)
            .map_err(|_| StageFailure::State)?;
    }

    let Some(node) = rt.nodes.get(&stage) else {
        log::error!("worker: no node for {stage}");
        return Err(StageFailure::State);
    };
    let wait = Duration::from_millis(desc.node_wait_ms);
    {
        let mut node = node.lock();
        let queued = dst.as_ref().or(src.as_ref());
        if let Some(buf) = queued {
            node.queue_buffer(buf, frame.count())
                .map_err(StageFailure::Node)?;
        }
    }
    let completion = dequeue_with_budget(node, wait, &rt.budget)?;
    if !completion.ok {
        log::warn!(
            "worker: {stage} flagged frame {} as bad (hw {})",
            frame.count(),
            completion.hw_frame_count
        );
        return Err(StageFailure::BadPayload);
    }

    // First completion fills the frame's dynamic metadata snapshot.
    if !frame.meta().filled {
        frame.store_meta(
            DynamicMeta {
                hw_frame_count: completion.hw_frame_count,
                ..DynamicMeta::default()
            },
            UserMeta::default(),
        );
    }
    if dst.is_some() {
        frame
            .set_dst_buffer_state(stage, BufferState::Complete)
            .map_err(|_| StageFailure::State)?;
    }
    // Consumed src goes straight back to the producing pool.
    if let Some(src) = src {
        frame
            .set_src_buffer_state(stage, BufferState::Complete)
            .map_err(|_| StageFailure::State)?;
        frame.take_src_buffer(stage);
        release_buffer(&rt.pools, &src, true);
    }
    frame
        .set_entity_state(stage, EntityState::FrameDone)
        .map_err(|_| StageFailure::State)?;
    Ok(())
}

fn obtain_with_budget(
    pool: &Arc<BufferPool>,
    frame_count: u64,
    stage: StageId,
    budget: &RetryBudget,
) -> Result<Buffer, StageFailure> {
    let mut attempt = 0;
    loop {
        match pool.get_buffer(frame_count) {
            Ok(mut buf) => {
                buf.tag = Some(stage);
                return Ok(buf);
            }
            Err(BufferError::Exhausted) if attempt < budget.attempts => {
                attempt += 1;
                log::trace!(
                    "worker: pool {} exhausted, retry {attempt}/{}",
                    pool.name(),
                    budget.attempts
                );
                thread::sleep(budget.backoff);
            }
            Err(err) => {
                log::warn!("worker: pool {} get failed: {err}", pool.name());
                return Err(StageFailure::PoolExhausted);
            }
        }
    }
}

fn dequeue_with_budget(
    node: &SharedNode,
    wait: Duration,
    budget: &RetryBudget,
) -> Result<crate::node::NodeCompletion, StageFailure> {
    let mut attempt = 0;
    loop {
        let result = node.lock().dequeue_buffer(wait);
        match result {
            Ok(completion) => return Ok(completion),
            Err(NodeError::Timeout) if attempt < budget.attempts => {
                attempt += 1;
                log::trace!("worker: dequeue timeout, retry {attempt}/{}", budget.attempts);
            }
            Err(err) => return Err(StageFailure::Node(err)),
        }
    }
}

/// Mark the failing entity, cancel its buffers, skip everything downstream,
/// and deliver the frame so its lifecycle still finishes.
fn fail_stage(rt: &ChainRuntime, frame: Frame, stage: StageId, failure: StageFailure) {
    match &failure {
        StageFailure::PoolExhausted => {
            log::warn!("worker: frame {} skipped at {stage}: pool budget", frame.count())
        }
        StageFailure::Node(err) => {
            log::warn!("worker: frame {} failed at {stage}: {err}", frame.count())
        }
        StageFailure::BadPayload => {}
        StageFailure::State => {
            log::error!("worker: frame {} state fault at {stage}", frame.count())
        }
    }
    if let Some(dst) = frame.take_dst_buffer(stage) {
        let _ = frame.set_dst_buffer_state(stage, BufferState::Error);
        release_buffer(&rt.pools, &dst, false);
    }
    if let Some(src) = frame.take_src_buffer(stage) {
        let _ = frame.set_src_buffer_state(stage, BufferState::Error);
        release_buffer(&rt.pools, &src, false);
    }
    let _ = frame.set_entity_state(stage, EntityState::Error);
    let _ = frame.skip_from(stage);
    rt.sink.on_frame_skip(frame);
}

/// Release a buffer to the pool of the stage that minted it: `put` after
/// productive use, `cancel` otherwise.
pub fn release_buffer(
    pools: &HashMap<StageId, Arc<BufferPool>>,
    buffer: &Buffer,
    used: bool,
) {
    let Some(tag) = buffer.tag else {
        return;
    };
    let Some(pool) = pools.get(&tag) else {
        log::error!("release: no pool registered for {tag}");
        return;
    };
    let result = if used {
        pool.put_buffer(buffer.index)
    } else {
        pool.cancel_buffer(buffer.index)
    };
    if let Err(err) = result {
        log::error!("release: pool {} index {}: {err}", pool.name(), buffer.index);
    }
}
