use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use aperture_core::prelude::{
    BufferPool, BufferState, Frame, FrameManager, RecvOutcome, ShotCounterSet, StageId, StageRx,
    stage_queue,
};
use aperture_pipeline::prelude::{
    BranchFlag, CapabilityKind, CapabilitySet, CaptureSelector, CompletionSink, FrameFactory,
    GraphVariant, PipeNode, REPROCESSING_HOLD_COUNT, RetryBudget, Routed, SelectionCriterion,
    VirtualNode, release_buffer, share, stage,
};

use crate::activity::{AutoFocus, FlashController, SpecialCapture, SpecialCaptureMode};
use crate::config::{ParameterSnapshot, PoolGeometryExt, PoolPlan, ScenarioFlags};
use crate::error::SessionError;
use crate::monitor::{HealthMonitor, ProgressSource};
use crate::notify::{
    CallbackCategory, DeliveryGate, DeliveryPayload, NotificationSink, NotifyEvent,
};
use crate::picture::{BurstReport, PictureDriver};
use crate::storage::{BurstWriter, resolve_burst_dir};

/// Coarse session state machine. `RecordingRunning` is an orthogonal
/// overlay tracked separately; vision is a mutually exclusive top state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PreviewStarting,
    PreviewRunning,
    PictureInProgress,
    PreviewStopping,
    VisionRunning,
}

/// Timing and sizing knobs applied at session construction; tests shorten
/// everything, production uses the defaults.
#[derive(Debug, Clone, Copy)]
pub struct SessionTunables {
    /// Feeder pace for minting preview frames.
    pub frame_interval: Duration,
    /// Wait used by factory input queues and delivery queues.
    pub queue_wait: Duration,
    /// Buffer exhaustion / dequeue retry policy for stage workers.
    pub retry_budget: RetryBudget,
    /// Sleep between capture-selection retries.
    pub selector_retry_wait: Duration,
    /// Selection retry count per capture iteration.
    pub select_retries: u32,
    /// Timed waits on the JPEG done queue before a capture iteration is
    /// written off as skipped.
    pub jpeg_wait_tries: u32,
    pub monitor_interval: Duration,
    pub stall_intervals: u32,
    /// Frame arena capacity.
    pub arena_capacity: usize,
    /// Parallel burst-save workers.
    pub save_threads: usize,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            queue_wait: Duration::from_millis(50),
            retry_budget: RetryBudget::default(),
            selector_retry_wait: Duration::from_millis(30),
            select_retries: 60,
            jpeg_wait_tries: 40,
            monitor_interval: Duration::from_millis(500),
            stall_intervals: 6,
            arena_capacity: 64,
            save_threads: 3,
        }
    }
}

/// Supplier of stage nodes; the embedder injects real device nodes here,
/// tests inject scripted virtual ones.
pub type NodeProvider = Box<dyn Fn(StageId, &str) -> Box<dyn PipeNode> + Send + Sync>;

struct SessionSink {
    manager: Arc<FrameManager>,
    pools: Mutex<HashMap<StageId, Arc<BufferPool>>>,
    completed: AtomicU64,
    skipped: AtomicU64,
}

impl SessionSink {
    fn set_pools(&self, pools: HashMap<StageId, Arc<BufferPool>>) {
        *self.pools.lock() = pools;
    }

    fn finalize(&self, frame: Frame) {
        let pools = self.pools.lock().clone();
        for stage in frame.stages() {
            let Some(entity) = frame.entity(stage) else {
                continue;
            };
            if let Some(dst) = frame.take_dst_buffer(stage) {
                release_buffer(&pools, &dst, entity.dst.state == BufferState::Complete);
            }
            if let Some(src) = frame.take_src_buffer(stage) {
                release_buffer(&pools, &src, entity.src.state == BufferState::Complete);
            }
        }
        if let Err(err) = self.manager.delete_frame(frame) {
            log::error!("session: frame delete failed: {err}");
        }
    }
}

impl CompletionSink for SessionSink {
    fn on_frame_done(&self, frame: Frame) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.finalize(frame);
    }
    fn on_frame_skip(&self, frame: Frame) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.finalize(frame);
    }
}

struct SessionProgress {
    factory: Arc<FrameFactory>,
    stuck: Arc<AtomicBool>,
}

impl ProgressSource for SessionProgress {
    fn snapshot(&self) -> Vec<(StageId, u64)> {
        self.factory.progress_snapshot()
    }
    fn device_stuck(&self) -> bool {
        self.stuck.load(Ordering::Acquire)
    }
    fn active(&self) -> bool {
        self.factory.is_running()
    }
}

struct GraphWires {
    display: Option<StageRx<Frame>>,
    video: Option<StageRx<Frame>>,
}

/// Top-level orchestration: preview, recording overlay, still-capture
/// bursts, vision mode, and mode switches (stop + re-derive + start).
pub struct SessionController {
    tunables: SessionTunables,
    params: Mutex<ParameterSnapshot>,
    flags: Mutex<Option<ScenarioFlags>>,
    state: Arc<Mutex<SessionState>>,
    manager: Arc<FrameManager>,
    notify: Arc<dyn NotificationSink>,
    gate: Arc<DeliveryGate>,
    counters: Arc<ShotCounterSet>,
    selector: Arc<CaptureSelector>,
    flash: Arc<FlashController>,
    af: Arc<AutoFocus>,
    special: Arc<SpecialCapture>,
    capabilities: Mutex<CapabilitySet>,
    sink: Arc<SessionSink>,
    pools: Mutex<HashMap<StageId, Arc<BufferPool>>>,
    preview_factory: Mutex<Option<Arc<FrameFactory>>>,
    reprocessing_factory: Mutex<Option<Arc<FrameFactory>>>,
    node_provider: Mutex<NodeProvider>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    feeder_stop: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    video_pump: Mutex<Option<JoinHandle<()>>>,
    pump_stop: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    monitor: Mutex<Option<HealthMonitor>>,
    picture_thread: Mutex<Option<JoinHandle<BurstReport>>>,
    burst_stop: Arc<AtomicBool>,
    last_burst: Arc<Mutex<Option<BurstReport>>>,
    last_hw_frame: Arc<AtomicU32>,
    device_stuck: Arc<AtomicBool>,
    jpeg_done: Mutex<Option<StageRx<Frame>>>,
    preview_deliveries: Arc<AtomicU64>,
    video_deliveries: Arc<AtomicU64>,
    save_pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
}

impl SessionController {
    pub fn new(notify: Arc<dyn NotificationSink>) -> Self {
        Self::with_tunables(notify, SessionTunables::default())
    }

    pub fn with_tunables(notify: Arc<dyn NotificationSink>, tunables: SessionTunables) -> Self {
        let manager = Arc::new(FrameManager::new("session", tunables.arena_capacity));
        let sink = Arc::new(SessionSink {
            manager: manager.clone(),
            pools: Mutex::new(HashMap::new()),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });
        Self {
            tunables,
            params: Mutex::new(ParameterSnapshot::default()),
            flags: Mutex::new(None),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            manager,
            notify,
            gate: Arc::new(DeliveryGate::new()),
            counters: Arc::new(ShotCounterSet::new()),
            selector: Arc::new(CaptureSelector::new(tunables.selector_retry_wait)),
            flash: Arc::new(FlashController::new()),
            af: Arc::new(AutoFocus::new()),
            special: Arc::new(SpecialCapture::new()),
            capabilities: Mutex::new(CapabilitySet::new()),
            sink,
            pools: Mutex::new(HashMap::new()),
            preview_factory: Mutex::new(None),
            reprocessing_factory: Mutex::new(None),
            node_provider: Mutex::new(Box::new(|_, name| {
                Box::new(VirtualNode::new(name)) as Box<dyn PipeNode>
            })),
            feeder: Mutex::new(None),
            feeder_stop: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
            video_pump: Mutex::new(None),
            pump_stop: Arc::new(AtomicBool::new(false)),
            recording: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            picture_thread: Mutex::new(None),
            burst_stop: Arc::new(AtomicBool::new(false)),
            last_burst: Arc::new(Mutex::new(None)),
            last_hw_frame: Arc::new(AtomicU32::new(0)),
            device_stuck: Arc::new(AtomicBool::new(false)),
            jpeg_done: Mutex::new(None),
            preview_deliveries: Arc::new(AtomicU64::new(0)),
            video_deliveries: Arc::new(AtomicU64::new(0)),
            save_pool: Mutex::new(None),
        }
    }

    /// Replace the stage-node supplier; call before starting.
    pub fn set_node_provider(&self, provider: NodeProvider) {
        *self.node_provider.lock() = provider;
    }

    /// Replace the parameter snapshot; applied at the next (re)start.
    pub fn set_params(&self, params: ParameterSnapshot) {
        *self.params.lock() = params;
    }

    pub fn attach_capability(&self, capability: aperture_pipeline::prelude::Capability) {
        self.capabilities.lock().attach(capability);
    }

    pub fn set_special_mode(&self, mode: SpecialCaptureMode) {
        self.special.set_mode(mode);
    }

    pub fn set_flash_required(&self, required: bool) {
        self.flash.set_required(required);
    }

    /// Hardware status hook: the embedder raises this on a data-path
    /// overflow; the monitor escalates it as fatal.
    pub fn set_device_stuck(&self, stuck: bool) {
        self.device_stuck.store(stuck, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn preview_deliveries(&self) -> u64 {
        self.preview_deliveries.load(Ordering::Acquire)
    }

    pub fn video_deliveries(&self) -> u64 {
        self.video_deliveries.load(Ordering::Acquire)
    }

    pub fn last_burst(&self) -> Option<BurstReport> {
        *self.last_burst.lock()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.manager.in_flight()
    }

    /// (created, deleted) frame totals for leak accounting.
    pub fn frame_stats(&self) -> (u64, u64) {
        (self.manager.created(), self.manager.deleted())
    }

    pub fn frames_completed(&self) -> u64 {
        self.sink.completed.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.sink.skipped.load(Ordering::Relaxed)
    }

    pub fn pool(&self, stage: StageId) -> Option<Arc<BufferPool>> {
        self.pools.lock().get(&stage).cloned()
    }

    pub fn counters(&self) -> &ShotCounterSet {
        &self.counters
    }

    /// Active preview graph's ordered stage ids (mode-switch comparisons).
    pub fn active_stage_ids(&self) -> Option<Vec<StageId>> {
        self.preview_factory.lock().as_ref().map(|f| f.stage_ids())
    }

    // ---- preview -------------------------------------------------------

    pub fn start_preview(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => *state = SessionState::PreviewStarting,
                s => {
                    return Err(SessionError::InvalidState {
                        op: "start_preview",
                        state: s,
                    });
                }
            }
        }
        let params = self.params.lock().clone();
        if params.vision_mode {
            *self.state.lock() = SessionState::Idle;
            return Err(SessionError::InvalidState {
                op: "start_preview",
                state: SessionState::Idle,
            });
        }
        let flags = ScenarioFlags::derive(&params);
        log::info!(
            "session: starting preview, variant {:?}, skip {} frames",
            flags.variant,
            flags.skip_frames
        );

        let pools = match self.setup_pools(&flags) {
            Ok(pools) => pools,
            Err(err) => {
                *self.state.lock() = SessionState::Idle;
                return Err(err);
            }
        };
        self.sink.set_pools(pools.clone());
        *self.pools.lock() = pools.clone();
        self.manager.start();

        let wires = match self.bring_up_graphs(&flags, &pools) {
            Ok(wires) => wires,
            Err(err) => {
                self.rollback_start();
                return Err(err);
            }
        };

        self.pump_stop.store(false, Ordering::Release);
        if params.high_resolution_callback
            && let Some(factory) = self.preview_factory.lock().as_ref()
        {
            factory.set_request(BranchFlag::PreviewCallback, true);
        }
        if let Some(display) = wires.display {
            self.spawn_pump(display, flags.skip_frames);
        }
        if let Some(video) = wires.video {
            self.spawn_video_pump(video);
        }
        self.spawn_feeder();
        self.af.arm_continuous();
        self.spawn_monitor();

        *self.flags.lock() = Some(flags);
        *self.state.lock() = SessionState::PreviewRunning;
        Ok(())
    }

    pub fn stop_preview(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => return Ok(()),
                SessionState::VisionRunning => {
                    return Err(SessionError::InvalidState {
                        op: "stop_preview",
                        state: SessionState::VisionRunning,
                    });
                }
                _ => *state = SessionState::PreviewStopping,
            }
        }
        log::info!("session: stopping preview");

        // A still capture mid-flight finishes first (bounded: its waits are
        // all timed and it polls the stop flag).
        self.burst_stop.store(true, Ordering::Release);
        self.selector.cancel_picture();
        if let Some(handle) = self.picture_thread.lock().take() {
            match handle.join() {
                Ok(report) => *self.last_burst.lock() = Some(report),
                Err(_) => log::error!("session: picture thread panicked"),
            }
        }

        self.af.disarm();
        self.flash.finish_capture();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }

        // Producers first: stop minting, then halt the stage graphs.
        self.feeder_stop.store(true, Ordering::Release);
        if let Some(handle) = self.feeder.lock().take() {
            let _ = handle.join();
        }
        self.recording.store(false, Ordering::Release);

        let preview = self.preview_factory.lock().clone();
        let reprocessing = self.reprocessing_factory.lock().clone();
        if let Some(factory) = &preview {
            let _ = factory.stop_pipes();
        }
        if let Some(factory) = &reprocessing {
            let _ = factory.stop_pipes();
        }

        // Consumers drain before the graphs are destroyed.
        self.pump_stop.store(true, Ordering::Release);
        if let Some(handle) = self.pump.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.video_pump.lock().take() {
            let _ = handle.join();
        }
        if let Some(rx) = self.jpeg_done.lock().take()
            && let Some(factory) = &reprocessing
        {
            for frame in rx.drain() {
                if let Ok(Routed::Terminal(frame)) = factory.forward_frame(frame, stage::JPEG) {
                    self.sink.on_frame_done(frame);
                }
            }
        }
        if let Some(factory) = &preview {
            factory.join_all();
        }
        if let Some(factory) = &reprocessing {
            factory.join_all();
        }

        for frame in self.selector.release() {
            self.sink.on_frame_done(frame);
        }
        if let Some(factory) = self.preview_factory.lock().take() {
            factory.destroy();
        }
        if let Some(factory) = self.reprocessing_factory.lock().take() {
            factory.destroy();
        }
        self.manager.stop();

        // Keep allocations for a fast restart; geometry changes are handled
        // by the next setup pass.
        for pool in self.pools.lock().values() {
            if pool.allocated() > 0
                && let Err(err) = pool.reset_buffers()
            {
                log::warn!("session: pool {} reset failed: {err}", pool.name());
            }
        }
        self.selector.set_frame_hold_count(1);
        *self.state.lock() = SessionState::Idle;
        Ok(())
    }

    /// Mode switch: stop, swap the snapshot, re-derive, start.
    pub fn restart_preview(&self, params: ParameterSnapshot) -> Result<(), SessionError> {
        match self.state() {
            SessionState::VisionRunning => self.stop_vision()?,
            SessionState::Idle => {}
            _ => self.stop_preview()?,
        }
        *self.params.lock() = params;
        if self.params.lock().vision_mode {
            self.start_vision()
        } else {
            self.start_preview()
        }
    }

    // ---- still capture -------------------------------------------------

    pub fn take_picture(&self) -> Result<(), SessionError> {
        {
            let state = self.state.lock();
            match *state {
                SessionState::PictureInProgress => {
                    // Burst continuation: just re-arm the counters.
                    let shots = self.burst_shots();
                    self.counters.arm(shots);
                    log::info!("session: burst re-armed for {shots} shots");
                    return Ok(());
                }
                SessionState::PreviewRunning => {}
                s => {
                    return Err(SessionError::InvalidState {
                        op: "take_picture",
                        state: s,
                    });
                }
            }
        }
        if let Some(handle) = self.picture_thread.lock().take() {
            let _ = handle.join();
        }

        let preview = self
            .preview_factory
            .lock()
            .clone()
            .ok_or(SessionError::MintFailed)?;
        let reprocessing = self
            .reprocessing_factory
            .lock()
            .clone()
            .ok_or(SessionError::MintFailed)?;
        let jpeg_done = self
            .jpeg_done
            .lock()
            .clone()
            .ok_or(SessionError::MintFailed)?;
        {
            let mut state = self.state.lock();
            if *state != SessionState::PreviewRunning {
                return Err(SessionError::CaptureBusy);
            }
            *state = SessionState::PictureInProgress;
        }

        let shots = self.burst_shots();
        self.counters.arm(shots);
        self.burst_stop.store(false, Ordering::Release);

        // Dynamic bayer: only frames created from here on carry the tap.
        preview.set_request(BranchFlag::CaptureTap, true);
        self.selector.set_frame_hold_count(REPROCESSING_HOLD_COUNT);
        self.selector.set_is_first_frame(true);

        if self.flash.required() {
            self.af.lock_for_capture();
            self.notify.notify(NotifyEvent::FocusLocked, 0, 0);
            if let Some(target) = self
                .flash
                .begin_capture(self.last_hw_frame.load(Ordering::Acquire))
            {
                self.selector
                    .set_criterion(SelectionCriterion::HwFrameCountAtLeast(target));
            }
        } else if let Some(best) = self.query_best_frame() {
            self.selector
                .set_criterion(SelectionCriterion::BestFrameNumber(best));
        } else {
            self.selector.set_criterion(SelectionCriterion::FirstAvailable);
        }

        let writer = if shots > 1 {
            let dir = resolve_burst_dir(self.params.lock().burst_dir.as_deref());
            Some(Arc::new(BurstWriter::new(dir, "burst")))
        } else {
            None
        };
        let save_pool = writer.as_ref().and_then(|_| self.save_workers());

        let driver = PictureDriver {
            selector: self.selector.clone(),
            reprocessing: reprocessing.clone(),
            preview: preview.clone(),
            manager: self.manager.clone(),
            counters: self.counters.clone(),
            notify: self.notify.clone(),
            gate: self.gate.clone(),
            special: self.special.clone(),
            flash: self.flash.clone(),
            jpeg_done,
            writer,
            save_pool,
            select_retries: self.tunables.select_retries,
            jpeg_wait_tries: self.tunables.jpeg_wait_tries,
            stop: self.burst_stop.clone(),
        };

        let state = self.state.clone();
        let last_burst = self.last_burst.clone();
        let selector = self.selector.clone();
        let manager = self.manager.clone();
        let preview_for_thread = preview.clone();
        let handle = thread::Builder::new()
            .name("picture-loop".into())
            .spawn(move || {
                let report = driver.run_burst();
                preview_for_thread.set_request(BranchFlag::CaptureTap, false);
                // Drain stale candidates so the next burst starts fresh.
                for frame in selector.release() {
                    preview_for_thread.release_frame(&frame);
                    if let Err(err) = manager.delete_frame(frame) {
                        log::error!("picture: hold-list drain delete failed: {err}");
                    }
                }
                selector.set_frame_hold_count(1);
                {
                    let mut state = state.lock();
                    if *state == SessionState::PictureInProgress {
                        *state = SessionState::PreviewRunning;
                    }
                }
                *last_burst.lock() = Some(report);
                report
            })
            .map_err(|_| SessionError::SetupThread)?;
        *self.picture_thread.lock() = Some(handle);
        Ok(())
    }

    /// Long-exposure/manual-shutter abort. Counters are cleared only after
    /// the exposure loop observed the stop flag.
    pub fn cancel_picture(&self) -> Result<(), SessionError> {
        if matches!(self.special.mode(), SpecialCaptureMode::LongExposure { .. })
            && !self
                .special
                .request_exposure_stop(Duration::from_millis(500))
        {
            log::warn!("session: long exposure abort not acknowledged in time");
        }
        self.burst_stop.store(true, Ordering::Release);
        self.selector.cancel_picture();
        if let Some(handle) = self.picture_thread.lock().take() {
            match handle.join() {
                Ok(report) => *self.last_burst.lock() = Some(report),
                Err(_) => log::error!("session: picture thread panicked"),
            }
        }
        self.counters.clear();
        let mut state = self.state.lock();
        if *state == SessionState::PictureInProgress {
            *state = SessionState::PreviewRunning;
        }
        Ok(())
    }

    // ---- recording overlay ---------------------------------------------

    pub fn start_recording(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::PreviewRunning | SessionState::PictureInProgress => {}
            s => {
                return Err(SessionError::InvalidState {
                    op: "start_recording",
                    state: s,
                });
            }
        }
        if self.recording.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(factory) = self.preview_factory.lock().as_ref() {
            factory.set_request(BranchFlag::Video, true);
        }
        log::info!("session: recording started");
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<(), SessionError> {
        if !self.recording.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(factory) = self.preview_factory.lock().as_ref() {
            factory.set_request(BranchFlag::Video, false);
        }
        log::info!("session: recording stopped");
        Ok(())
    }

    // ---- vision --------------------------------------------------------

    pub fn start_vision(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => *state = SessionState::PreviewStarting,
                s => {
                    return Err(SessionError::InvalidState {
                        op: "start_vision",
                        state: s,
                    });
                }
            }
        }
        self.params.lock().vision_mode = true;
        let params = self.params.lock().clone();
        let flags = ScenarioFlags::derive(&params);

        let pools = match self.setup_pools(&flags) {
            Ok(pools) => pools,
            Err(err) => {
                *self.state.lock() = SessionState::Idle;
                return Err(err);
            }
        };
        self.sink.set_pools(pools.clone());
        *self.pools.lock() = pools.clone();
        self.manager.start();

        match self.bring_up_graphs(&flags, &pools) {
            Ok(_) => {}
            Err(err) => {
                self.rollback_start();
                return Err(err);
            }
        }
        self.spawn_feeder();
        self.spawn_monitor();
        *self.flags.lock() = Some(flags);
        *self.state.lock() = SessionState::VisionRunning;
        log::info!("session: vision mode running");
        Ok(())
    }

    pub fn stop_vision(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => return Ok(()),
                SessionState::VisionRunning => *state = SessionState::PreviewStopping,
                s => {
                    return Err(SessionError::InvalidState {
                        op: "stop_vision",
                        state: s,
                    });
                }
            }
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        self.feeder_stop.store(true, Ordering::Release);
        if let Some(handle) = self.feeder.lock().take() {
            let _ = handle.join();
        }
        if let Some(factory) = self.preview_factory.lock().take() {
            let _ = factory.stop_pipes();
            factory.join_all();
            factory.destroy();
        }
        self.manager.stop();
        for pool in self.pools.lock().values() {
            if pool.allocated() > 0
                && let Err(err) = pool.reset_buffers()
            {
                log::warn!("session: pool {} reset failed: {err}", pool.name());
            }
        }
        self.params.lock().vision_mode = false;
        *self.state.lock() = SessionState::Idle;
        Ok(())
    }

    // ---- internals -----------------------------------------------------

    fn burst_shots(&self) -> u32 {
        let series = self
            .flags
            .lock()
            .as_ref()
            .map(|f| f.series_shot_count)
            .unwrap_or(1);
        self.special.shots_for(series)
    }

    fn query_best_frame(&self) -> Option<u64> {
        let capabilities = self.capabilities.lock();
        let capability = capabilities.get(CapabilityKind::BestPhoto)?;
        let bytes = capability.with_plugin(|p| p.get(0))?;
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    fn save_workers(&self) -> Option<Arc<rayon::ThreadPool>> {
        let mut slot = self.save_pool.lock();
        if slot.is_none() {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.tunables.save_threads)
                .thread_name(|i| format!("burst-save-{i}"))
                .build()
            {
                Ok(pool) => *slot = Some(Arc::new(pool)),
                Err(err) => {
                    log::error!("session: save pool build failed: {err}");
                    return None;
                }
            }
        }
        slot.clone()
    }

    /// Allocate/resize every pool the scenario needs, on a dedicated setup
    /// thread joined before any frame is pushed.
    fn setup_pools(
        &self,
        flags: &ScenarioFlags,
    ) -> Result<HashMap<StageId, Arc<BufferPool>>, SessionError> {
        let plans: Vec<PoolPlan> = flags
            .preview_pools
            .iter()
            .chain(flags.reprocessing_pools.iter())
            .cloned()
            .collect();
        let existing = self.pools.lock().clone();
        let handle = thread::Builder::new()
            .name("pool-setup".into())
            .spawn(move || -> Result<HashMap<StageId, Arc<BufferPool>>, SessionError> {
                let mut out = HashMap::new();
                for plan in plans {
                    let pool = existing
                        .get(&plan.stage)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(BufferPool::new(plan.name)));
                    match pool.geometry() {
                        Some(current) if current.matches(&plan.geometry) => {
                            pool.reset_buffers()?;
                        }
                        Some(_) => {
                            pool.deinit()?;
                            pool.set_info(plan.geometry.clone())?;
                            pool.alloc()?;
                        }
                        None => {
                            pool.set_info(plan.geometry.clone())?;
                            pool.alloc()?;
                        }
                    }
                    out.insert(plan.stage, pool);
                }
                Ok(out)
            })
            .map_err(|_| SessionError::SetupThread)?;
        handle.join().map_err(|_| SessionError::SetupThread)?
    }

    fn bring_up_graphs(
        &self,
        flags: &ScenarioFlags,
        pools: &HashMap<StageId, Arc<BufferPool>>,
    ) -> Result<GraphWires, SessionError> {
        let preview = Arc::new(FrameFactory::new(
            "preview",
            flags.variant,
            self.manager.clone(),
            self.sink.clone(),
        ));
        preview.set_retry_budget(self.tunables.retry_budget);
        preview.set_queue_wait(self.tunables.queue_wait);
        {
            let provider = self.node_provider.lock();
            for (id, name) in preview.stage_names() {
                preview.register_node(id, share(provider(id, name)))?;
            }
        }
        for plan in &flags.preview_pools {
            if let Some(pool) = pools.get(&plan.stage) {
                preview.attach_pool(plan.stage, pool.clone())?;
            }
        }
        let mut wires = GraphWires {
            display: None,
            video: None,
        };
        if flags.variant != GraphVariant::Vision {
            let (display_tx, display_rx) = stage_queue(self.tunables.queue_wait);
            preview.set_output_frame_queue(stage::SCALER, display_tx)?;
            wires.display = Some(display_rx);
            let (video_tx, video_rx) = stage_queue(self.tunables.queue_wait);
            preview.set_output_frame_queue(stage::VIDEO, video_tx)?;
            wires.video = Some(video_rx);
            if flags.reprocessing {
                preview.set_selector(stage::CAPTURE_TAP, self.selector.clone())?;
            }
        }
        *self.preview_factory.lock() = Some(preview.clone());
        preview.create()?;
        preview.init_pipes()?;
        preview.prepare_pipes()?;
        preview.start_pipes()?;

        if flags.reprocessing {
            let reprocessing = Arc::new(FrameFactory::new(
                "reprocessing",
                GraphVariant::Reprocessing,
                self.manager.clone(),
                self.sink.clone(),
            ));
            reprocessing.set_retry_budget(self.tunables.retry_budget);
            reprocessing.set_queue_wait(self.tunables.queue_wait);
            {
                let provider = self.node_provider.lock();
                for (id, name) in reprocessing.stage_names() {
                    reprocessing.register_node(id, share(provider(id, name)))?;
                }
            }
            for plan in &flags.reprocessing_pools {
                if let Some(pool) = pools.get(&plan.stage) {
                    reprocessing.attach_pool(plan.stage, pool.clone())?;
                }
            }
            // The preview bayer tap pool, so handed-over sources can be
            // returned from inside this graph.
            if let Some(tap_pool) = pools.get(&stage::CAPTURE_TAP) {
                reprocessing.attach_pool(stage::CAPTURE_TAP, tap_pool.clone())?;
            }
            let (jpeg_tx, jpeg_rx) = stage_queue(self.tunables.queue_wait);
            reprocessing.set_output_frame_queue(stage::JPEG, jpeg_tx)?;
            *self.reprocessing_factory.lock() = Some(reprocessing.clone());
            reprocessing.create()?;
            reprocessing.init_pipes()?;
            reprocessing.prepare_pipes()?;
            reprocessing.start_pipes()?;
            *self.jpeg_done.lock() = Some(jpeg_rx);
        }
        Ok(wires)
    }

    fn rollback_start(&self) {
        log::warn!("session: rolling back failed start");
        if let Some(factory) = self.preview_factory.lock().take() {
            factory.destroy();
        }
        if let Some(factory) = self.reprocessing_factory.lock().take() {
            factory.destroy();
        }
        *self.jpeg_done.lock() = None;
        self.manager.stop();
        *self.state.lock() = SessionState::Idle;
    }

    fn spawn_pump(&self, display: StageRx<Frame>, skip_frames: u32) {
        let Some(factory) = self.preview_factory.lock().clone() else {
            return;
        };
        let sink = self.sink.clone();
        let gate = self.gate.clone();
        let notify = self.notify.clone();
        let stop = self.pump_stop.clone();
        let last_hw = self.last_hw_frame.clone();
        let deliveries = self.preview_deliveries.clone();
        let handle = thread::Builder::new()
            .name("preview-pump".into())
            .spawn(move || {
                let mut remaining_skip = skip_frames;
                loop {
                    match display.recv_wait() {
                        RecvOutcome::Data(frame) => {
                            let meta = frame.meta();
                            last_hw.store(meta.dynamic.hw_frame_count, Ordering::Release);
                            if remaining_skip > 0 {
                                // AE has not settled yet; drop the callback,
                                // not the frame.
                                remaining_skip -= 1;
                            } else {
                                let payload = DeliveryPayload {
                                    frame_count: frame.count(),
                                    buffer: frame.dst_buffer(stage::SCALER),
                                    meta,
                                };
                                if gate.deliver(
                                    notify.as_ref(),
                                    CallbackCategory::Preview,
                                    &payload,
                                ) {
                                    deliveries.fetch_add(1, Ordering::Relaxed);
                                }
                                // Shot results ride along for face detection
                                // without re-acquiring from hardware.
                                let meta_payload = DeliveryPayload {
                                    frame_count: frame.count(),
                                    buffer: None,
                                    meta,
                                };
                                gate.deliver(
                                    notify.as_ref(),
                                    CallbackCategory::Metadata,
                                    &meta_payload,
                                );
                                if frame.request_flags().preview_callback {
                                    // High-resolution callback path.
                                    gate.deliver(
                                        notify.as_ref(),
                                        CallbackCategory::Picture,
                                        &payload,
                                    );
                                }
                            }
                            match factory.forward_frame(frame, stage::SCALER) {
                                Ok(Routed::Terminal(frame)) => sink.on_frame_done(frame),
                                Ok(Routed::Forwarded) => {}
                                Err(err) => {
                                    log::warn!("pump: forward failed: {err}")
                                }
                            }
                        }
                        RecvOutcome::Empty => {
                            if stop.load(Ordering::Acquire) && display.is_empty() {
                                break;
                            }
                        }
                        RecvOutcome::Closed => break,
                    }
                }
                log::debug!("pump: exiting");
            })
            .ok();
        *self.pump.lock() = handle;
    }

    fn spawn_video_pump(&self, video: StageRx<Frame>) {
        let Some(factory) = self.preview_factory.lock().clone() else {
            return;
        };
        let sink = self.sink.clone();
        let gate = self.gate.clone();
        let notify = self.notify.clone();
        let stop = self.pump_stop.clone();
        let deliveries = self.video_deliveries.clone();
        let handle = thread::Builder::new()
            .name("video-pump".into())
            .spawn(move || {
                loop {
                    match video.recv_wait() {
                        RecvOutcome::Data(frame) => {
                            let payload = DeliveryPayload {
                                frame_count: frame.count(),
                                buffer: frame.dst_buffer(stage::VIDEO),
                                meta: frame.meta(),
                            };
                            if gate.deliver(notify.as_ref(), CallbackCategory::Video, &payload) {
                                deliveries.fetch_add(1, Ordering::Relaxed);
                            }
                            match factory.forward_frame(frame, stage::VIDEO) {
                                Ok(Routed::Terminal(frame)) => sink.on_frame_done(frame),
                                Ok(Routed::Forwarded) => {}
                                Err(err) => log::warn!("video pump: forward failed: {err}"),
                            }
                        }
                        RecvOutcome::Empty => {
                            if stop.load(Ordering::Acquire) && video.is_empty() {
                                break;
                            }
                        }
                        RecvOutcome::Closed => break,
                    }
                }
            })
            .ok();
        *self.video_pump.lock() = handle;
    }

    fn spawn_feeder(&self) {
        let Some(factory) = self.preview_factory.lock().clone() else {
            return;
        };
        self.feeder_stop.store(false, Ordering::Release);
        let stop = self.feeder_stop.clone();
        let recording = self.recording.clone();
        let interval = self.tunables.frame_interval;
        let handle = thread::Builder::new()
            .name("frame-feeder".into())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if factory.is_running() {
                        match factory.create_frame() {
                            Ok(frame) => {
                                if let Some(head) = frame.first_stage()
                                    && let Err(err) = factory.push_frame(frame, head)
                                {
                                    log::debug!("feeder: push failed: {err}");
                                }
                            }
                            Err(err) => log::debug!("feeder: mint failed: {err}"),
                        }
                        if recording.load(Ordering::Acquire)
                            && let Ok(frame) = factory.create_frame_video_only()
                            && let Err(err) = factory.push_frame(frame, stage::VIDEO)
                        {
                            log::debug!("feeder: video push failed: {err}");
                        }
                    }
                    thread::sleep(interval);
                }
                log::debug!("feeder: exiting");
            })
            .ok();
        *self.feeder.lock() = handle;
    }

    fn spawn_monitor(&self) {
        let Some(factory) = self.preview_factory.lock().clone() else {
            return;
        };
        let source = Arc::new(SessionProgress {
            factory,
            stuck: self.device_stuck.clone(),
        });
        let notify = self.notify.clone();
        let monitor = HealthMonitor::spawn(
            self.tunables.monitor_interval,
            self.tunables.stall_intervals,
            source,
            move |fault| {
                notify.notify(NotifyEvent::Error(fault), 0, 0);
            },
        );
        *self.monitor.lock() = Some(monitor);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        match self.state() {
            SessionState::Idle => {}
            SessionState::VisionRunning => {
                let _ = self.stop_vision();
            }
            _ => {
                let _ = self.stop_preview();
            }
        }
    }
}
