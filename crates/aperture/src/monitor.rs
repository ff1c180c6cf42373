use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aperture_core::prelude::StageId;

use crate::notify::FaultKind;

/// What the monitor samples each interval.
pub trait ProgressSource: Send + Sync {
    /// Per-stage forward-progress counters ("thread renew").
    fn snapshot(&self) -> Vec<(StageId, u64)>;
    /// Explicit device stuck/overflow status flag.
    fn device_stuck(&self) -> bool;
    /// Whether the pipeline is expected to be moving; stalls are only
    /// counted while active.
    fn active(&self) -> bool;
}

/// Periodic health monitor.
///
/// A stage whose progress counter does not move for `stall_intervals`
/// consecutive samples while the pipeline is active, or an explicit device
/// stuck flag, is unrecoverable: the fault is surfaced once through
/// `on_fatal` and the monitor stops watching. No internal retry.
pub struct HealthMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn spawn<F>(
        interval: Duration,
        stall_intervals: u32,
        source: Arc<dyn ProgressSource>,
        on_fatal: F,
    ) -> Self
    where
        F: Fn(FaultKind) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || {
                let mut last: HashMap<StageId, u64> = HashMap::new();
                let mut stalled: HashMap<StageId, u32> = HashMap::new();
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        return;
                    }
                    thread::sleep(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        return;
                    }
                    if source.device_stuck() {
                        log::error!("monitor: device reports stuck data path");
                        on_fatal(FaultKind::DeviceStuck);
                        return;
                    }
                    if !source.active() {
                        last.clear();
                        stalled.clear();
                        continue;
                    }
                    for (stage, count) in source.snapshot() {
                        match last.insert(stage, count) {
                            Some(previous) if previous == count => {
                                let misses = stalled.entry(stage).or_insert(0);
                                *misses += 1;
                                if *misses >= stall_intervals {
                                    log::error!(
                                        "monitor: {stage} made no progress for {misses} intervals"
                                    );
                                    on_fatal(FaultKind::StageStall);
                                    return;
                                }
                            }
                            _ => {
                                stalled.remove(&stage);
                            }
                        }
                    }
                }
            })
            .ok();
        if handle.is_none() {
            log::error!("monitor: spawn failed");
        }
        Self {
            stop,
            handle,
        }
    }

    /// Stop watching and join.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    struct FakeSource {
        ticks: AtomicU64,
        moving: AtomicBool,
        stuck: AtomicBool,
    }

    impl ProgressSource for FakeSource {
        fn snapshot(&self) -> Vec<(StageId, u64)> {
            if self.moving.load(Ordering::Acquire) {
                self.ticks.fetch_add(1, Ordering::AcqRel);
            }
            vec![(StageId(0), self.ticks.load(Ordering::Acquire))]
        }
        fn device_stuck(&self) -> bool {
            self.stuck.load(Ordering::Acquire)
        }
        fn active(&self) -> bool {
            true
        }
    }

    fn wait_for_fault(faults: &Mutex<Vec<FaultKind>>, deadline: Duration) -> Option<FaultKind> {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if let Some(&fault) = faults.lock().first() {
                return Some(fault);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn moving_pipeline_raises_nothing() {
        let source = Arc::new(FakeSource {
            ticks: AtomicU64::new(0),
            moving: AtomicBool::new(true),
            stuck: AtomicBool::new(false),
        });
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let monitor = HealthMonitor::spawn(
            Duration::from_millis(10),
            3,
            source,
            move |fault| sink.lock().push(fault),
        );
        thread::sleep(Duration::from_millis(100));
        monitor.stop();
        assert!(faults.lock().is_empty());
    }

    #[test]
    fn stall_surfaces_single_fatal() {
        let source = Arc::new(FakeSource {
            ticks: AtomicU64::new(0),
            moving: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
        });
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let monitor = HealthMonitor::spawn(
            Duration::from_millis(10),
            3,
            source,
            move |fault| sink.lock().push(fault),
        );
        let fault = wait_for_fault(&faults, Duration::from_secs(5));
        assert_eq!(fault, Some(FaultKind::StageStall));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(faults.lock().len(), 1);
        monitor.stop();
    }

    #[test]
    fn device_stuck_flag_escalates_immediately() {
        let source = Arc::new(FakeSource {
            ticks: AtomicU64::new(0),
            moving: AtomicBool::new(true),
            stuck: AtomicBool::new(true),
        });
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let _monitor = HealthMonitor::spawn(
            Duration::from_millis(10),
            10,
            source,
            move |fault| sink.lock().push(fault),
        );
        let fault = wait_for_fault(&faults, Duration::from_secs(5));
        assert_eq!(fault, Some(FaultKind::DeviceStuck));
    }
}
