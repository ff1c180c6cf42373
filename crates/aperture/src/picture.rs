use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use aperture_core::prelude::{Frame, FrameManager, RecvOutcome, ShotCounterSet, StageRx};
use aperture_pipeline::prelude::{CaptureSelector, FrameFactory, Routed, stage};

use crate::activity::{FlashController, SpecialCapture, SpecialCaptureMode};
use crate::notify::{CallbackCategory, DeliveryGate, DeliveryPayload, NotificationSink, NotifyEvent};
use crate::storage::BurstWriter;

/// Outcome of one burst.
#[derive(Debug, Default, Clone, Copy)]
pub struct BurstReport {
    pub delivered: u32,
    pub skipped: u32,
}

/// Runs one still-capture burst on its own thread: pre-picture frame
/// selection, reprocessing through the picture graph, JPEG callback
/// delivery, and burst saving.
///
/// The four shot counters drive loop re-arming; each reaches zero exactly
/// once per burst whether an iteration delivers or skips.
pub struct PictureDriver {
    pub selector: Arc<CaptureSelector>,
    pub reprocessing: Arc<FrameFactory>,
    pub preview: Arc<FrameFactory>,
    pub manager: Arc<FrameManager>,
    pub counters: Arc<ShotCounterSet>,
    pub notify: Arc<dyn NotificationSink>,
    pub gate: Arc<DeliveryGate>,
    pub special: Arc<SpecialCapture>,
    pub flash: Arc<FlashController>,
    pub jpeg_done: StageRx<Frame>,
    pub writer: Option<Arc<BurstWriter>>,
    pub save_pool: Option<Arc<rayon::ThreadPool>>,
    pub select_retries: u32,
    pub jpeg_wait_tries: u32,
    pub stop: Arc<AtomicBool>,
}

impl PictureDriver {
    /// Drive the burst until the take-picture counter converges or a stop
    /// is requested.
    pub fn run_burst(&self) -> BurstReport {
        let mut report = BurstReport::default();
        while self.counters.take_picture.get() > 0 {
            if self.stop.load(Ordering::Acquire) {
                log::info!("picture: burst stop requested");
                break;
            }
            if let SpecialCaptureMode::LongExposure { duration_ms } = self.special.mode() {
                self.special.begin_exposure();
                if self.run_long_exposure(duration_ms) {
                    log::info!("picture: long exposure aborted");
                    report.skipped += 1;
                    break;
                }
                self.special.finish_exposure();
            }
            let remaining = self.counters.take_picture.dec();
            self.notify.notify(NotifyEvent::Shutter, remaining as i32, 0);

            let (winner, rejects) = self.selector.select_frames(self.select_retries);
            for reject in rejects {
                self.finalize_preview_frame(reject);
            }
            let Some(winner) = winner else {
                log::warn!("picture: no candidate for this iteration");
                self.counters.reprocessing.dec();
                self.skip_tail(&mut report);
                continue;
            };
            self.selector.set_is_first_frame(false);
            self.counters.reprocessing.dec();
            log::info!(
                "picture: pre-picture complete, remaining {}",
                self.counters.reprocessing.get()
            );

            if self.run_reprocessing(winner) {
                report.delivered += 1;
            } else {
                report.skipped += 1;
                self.notify.notify(NotifyEvent::FrameDropped, 0, 0);
            }
        }
        self.flash.finish_capture();
        log::info!(
            "picture: burst done, delivered {} skipped {}",
            report.delivered,
            report.skipped
        );
        report
    }

    /// Returns true when the exposure was aborted by a cancel.
    fn run_long_exposure(&self, duration_ms: u64) -> bool {
        let slices = duration_ms.div_ceil(10).max(1);
        for _ in 0..slices {
            if self.special.exposure_stop_requested() {
                return true;
            }
            if self.stop.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Push the selected bayer through the reprocessing graph and deliver
    /// the JPEG. Returns true when a callback went out.
    fn run_reprocessing(&self, winner: Frame) -> bool {
        let frame = match self.reprocessing.create_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("picture: reprocessing mint failed: {err}");
                self.finalize_preview_frame(winner);
                self.dec_tail();
                return false;
            }
        };
        // The winner's bayer tap output becomes the reprocessing source.
        if let Some(bayer) = winner.take_dst_buffer(stage::CAPTURE_TAP)
            && frame.set_src_buffer(stage::BAYER, bayer).is_err()
        {
            log::error!("picture: bayer handover rejected");
        }
        self.finalize_preview_frame(winner);

        if let Err(err) = self.reprocessing.push_frame(frame, stage::BAYER) {
            log::error!("picture: reprocessing push failed: {err}");
            self.dec_tail();
            return false;
        }

        let mut tries = 0;
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.dec_tail();
                return false;
            }
            match self.jpeg_done.recv_wait() {
                RecvOutcome::Data(done) => return self.deliver_jpeg(done),
                RecvOutcome::Empty => {
                    tries += 1;
                    if tries >= self.jpeg_wait_tries {
                        log::warn!("picture: reprocessing produced no JPEG in time");
                        self.dec_tail();
                        return false;
                    }
                }
                RecvOutcome::Closed => {
                    self.dec_tail();
                    return false;
                }
            }
        }
    }

    fn deliver_jpeg(&self, frame: Frame) -> bool {
        let frame = match self.reprocessing.forward_frame(frame, stage::JPEG) {
            Ok(Routed::Terminal(frame)) => frame,
            Ok(Routed::Forwarded) => {
                log::error!("picture: JPEG frame routed past the tail");
                self.dec_tail();
                return false;
            }
            Err(err) => {
                log::error!("picture: JPEG completion failed: {err}");
                self.dec_tail();
                return false;
            }
        };
        self.counters.picture.dec();
        self.counters.jpeg.dec();

        let jpeg_buffer = frame.dst_buffer(stage::JPEG);
        let payload = DeliveryPayload {
            frame_count: frame.count(),
            buffer: jpeg_buffer.clone(),
            meta: frame.meta(),
        };
        self.gate
            .deliver(self.notify.as_ref(), CallbackCategory::JpegImage, &payload);
        self.counters.jpeg_callback.dec();
        log::info!(
            "picture: jpeg delivered for frame {}, remaining {}",
            frame.count(),
            self.counters.jpeg_callback.get()
        );

        if let Some(writer) = &self.writer {
            let len = jpeg_buffer
                .as_ref()
                .and_then(|b| b.planes.first().map(|p| p.size))
                .unwrap_or(0);
            let writer = writer.clone();
            let save = move || {
                if let Err(err) = writer.save(&vec![0u8; len]) {
                    log::error!("picture: burst save failed: {err}");
                }
            };
            match &self.save_pool {
                Some(pool) => pool.spawn(save),
                None => save(),
            }
        }

        self.reprocessing.release_frame(&frame);
        if let Err(err) = self.manager.delete_frame(frame) {
            log::error!("picture: reprocessing frame delete failed: {err}");
        }
        true
    }

    /// Converge the post-selection counters for an iteration that produced
    /// no output.
    fn skip_tail(&self, report: &mut BurstReport) {
        self.dec_tail();
        report.skipped += 1;
    }

    fn dec_tail(&self) {
        self.counters.picture.dec();
        self.counters.jpeg.dec();
        self.counters.jpeg_callback.dec();
    }

    /// Release and delete a preview-side frame (winner, reject, or evicted
    /// hold-list entry).
    fn finalize_preview_frame(&self, frame: Frame) {
        self.preview.release_frame(&frame);
        if let Err(err) = self.manager.delete_frame(frame) {
            log::error!("picture: preview frame delete failed: {err}");
        }
    }
}
