use std::sync::atomic::{AtomicBool, Ordering};

use aperture_core::prelude::{Buffer, FrameMeta};

/// Fire-and-forget events surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Shutter,
    FocusLocked,
    FrameDropped,
    Error(FaultKind),
}

/// Unrecoverable fault classes; the session is expected to be torn down and
/// reopened by the caller after one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    StageStall,
    DeviceStuck,
    Unrecoverable,
}

/// Named callback categories with independent delivery gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackCategory {
    Preview,
    Video,
    Picture,
    JpegImage,
    Metadata,
}

impl CallbackCategory {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            CallbackCategory::Preview => 0,
            CallbackCategory::Video => 1,
            CallbackCategory::Picture => 2,
            CallbackCategory::JpegImage => 3,
            CallbackCategory::Metadata => 4,
        }
    }
}

/// Payload handed to the sink for one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryPayload {
    pub frame_count: u64,
    pub buffer: Option<Buffer>,
    pub meta: FrameMeta,
}

/// Opaque notification/callback sink provided by the embedder.
///
/// `notify` is fire-and-forget; `deliver_data` calls are serialized per
/// category by [`DeliveryGate`] so the sink never observes two interleaved
/// payload deliveries of the same category.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: NotifyEvent, arg1: i32, arg2: i32);
    fn deliver_data(&self, category: CallbackCategory, payload: &DeliveryPayload);
}

/// Sink that drops everything; used when the embedder wires nothing.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: NotifyEvent, _arg1: i32, _arg2: i32) {}
    fn deliver_data(&self, _category: CallbackCategory, _payload: &DeliveryPayload) {}
}

/// Per-category busy bits enforcing at most one concurrent `deliver_data`
/// per category.
#[derive(Default)]
pub struct DeliveryGate {
    busy: [AtomicBool; CallbackCategory::COUNT],
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver through the gate; returns false when the category was busy
    /// and the payload was dropped instead of interleaved.
    pub fn deliver(
        &self,
        sink: &dyn NotificationSink,
        category: CallbackCategory,
        payload: &DeliveryPayload,
    ) -> bool {
        let slot = &self.busy[category.slot()];
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("delivery gate: {category:?} busy, dropping frame {}", payload.frame_count);
            return false;
        }
        sink.deliver_data(category, payload);
        slot.store(false, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    struct SlowSink {
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
        delivered: AtomicU32,
    }

    impl NotificationSink for SlowSink {
        fn notify(&self, _event: NotifyEvent, _arg1: i32, _arg2: i32) {}
        fn deliver_data(&self, _category: CallbackCategory, _payload: &DeliveryPayload) {
            let now = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_concurrent.fetch_max(now, Ordering::AcqRel);
            thread::sleep(Duration::from_millis(10));
            self.concurrent.fetch_sub(1, Ordering::AcqRel);
            self.delivered.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn payload(count: u64) -> DeliveryPayload {
        DeliveryPayload {
            frame_count: count,
            buffer: None,
            meta: FrameMeta::default(),
        }
    }

    #[test]
    fn gate_serializes_one_category() {
        let sink = Arc::new(SlowSink {
            concurrent: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        });
        let gate = Arc::new(DeliveryGate::new());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let sink = sink.clone();
            let gate = gate.clone();
            handles.push(thread::spawn(move || {
                gate.deliver(sink.as_ref(), CallbackCategory::Preview, &payload(i))
            }));
        }
        let attempts: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().expect("deliver thread"))
            .collect();
        assert_eq!(sink.max_concurrent.load(Ordering::Acquire), 1);
        // At least one delivery went through; busy attempts were dropped,
        // not interleaved.
        let ok = attempts.iter().filter(|&&b| b).count() as u32;
        assert!(ok >= 1);
        assert_eq!(sink.delivered.load(Ordering::Acquire), ok);
    }

    #[test]
    fn gate_categories_are_independent() {
        let sink = Arc::new(SlowSink {
            concurrent: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        });
        let gate = Arc::new(DeliveryGate::new());
        let a = {
            let (sink, gate) = (sink.clone(), gate.clone());
            thread::spawn(move || {
                gate.deliver(sink.as_ref(), CallbackCategory::Preview, &payload(1))
            })
        };
        let b = {
            let (sink, gate) = (sink.clone(), gate.clone());
            thread::spawn(move || {
                gate.deliver(sink.as_ref(), CallbackCategory::Video, &payload(2))
            })
        };
        assert!(a.join().expect("a"));
        assert!(b.join().expect("b"));
        assert_eq!(sink.delivered.load(Ordering::Acquire), 2);
    }
}
