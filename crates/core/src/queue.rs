use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{SendOutcome, stage_queue};
/// use std::time::Duration;
///
/// let (tx, _rx) = stage_queue::<u8>(Duration::from_millis(10));
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is at capacity.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
///
/// `Empty` from a timed receive means the wait budget elapsed, not that the
/// queue is dead; workers poll their stop flag and wait again.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty (or the timed wait elapsed).
    Empty,
}

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
    closed: AtomicBool,
    capacity: Option<usize>,
    wait: Duration,
}

/// Sender half of a stage queue.
pub struct StageTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for StageTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StageTx<T> {
    /// Enqueue a value, waking one waiting receiver.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        {
            let mut items = self.inner.items.lock();
            if let Some(cap) = self.inner.capacity
                && items.len() >= cap
            {
                return SendOutcome::Full;
            }
            items.push_back(value);
        }
        self.inner.cond.notify_one();
        SendOutcome::Ok
    }

    /// Like `send`, but hands the value back on `Full`/`Closed` so callers
    /// owning non-droppable values (frames) can resolve them.
    pub fn send_or_return(&self, value: T) -> Result<(), (T, SendOutcome)> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err((value, SendOutcome::Closed));
        }
        {
            let mut items = self.inner.items.lock();
            if let Some(cap) = self.inner.capacity
                && items.len() >= cap
            {
                return Err((value, SendOutcome::Full));
            }
            items.push_back(value);
        }
        self.inner.cond.notify_one();
        Ok(())
    }

    /// Close the queue to further sends and wake all waiters.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiver half of a stage queue.
///
/// Each pipeline stage owns one receiver; the configured wait is tuned to the
/// expected latency of the stage feeding it.
pub struct StageRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for StageRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StageRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        let mut items = self.inner.items.lock();
        match items.pop_front() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Receive, blocking up to the queue's configured wait.
    pub fn recv_wait(&self) -> RecvOutcome<T> {
        self.recv_timeout(self.inner.wait)
    }

    /// Receive, blocking up to `timeout`.
    ///
    /// Returns `Empty` when the timeout elapses with nothing queued. A
    /// `wake()` from another thread also ends the wait early so stop flags
    /// get polled promptly.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        let mut items = self.inner.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                return RecvOutcome::Data(value);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return RecvOutcome::Closed;
            }
            if self.inner.cond.wait_for(&mut items, timeout).timed_out() {
                return match items.pop_front() {
                    Some(value) => RecvOutcome::Data(value),
                    None if self.inner.closed.load(Ordering::Acquire) => RecvOutcome::Closed,
                    None => RecvOutcome::Empty,
                };
            }
            // Woken: either data arrived or a wake()/close() fired; re-check
            // both and return Empty on a bare wake so the caller can poll its
            // stop flag.
            if items.is_empty() && !self.inner.closed.load(Ordering::Acquire) {
                return RecvOutcome::Empty;
            }
        }
    }

    /// Wake all blocked receivers without closing the queue.
    ///
    /// Stop paths use this to unblock a worker mid-wait.
    pub fn wake(&self) {
        self.inner.cond.notify_all();
    }

    /// Mark the queue as closed; senders will see `Closed` and exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.inner.items.lock().drain(..).collect()
    }
}

#[cfg(feature = "async")]
impl<T> StageRx<T> {
    /// Async helper that yields until data or closure.
    pub async fn recv_async(&self) -> RecvOutcome<T> {
        loop {
            match self.recv() {
                RecvOutcome::Empty => {
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }
}

/// Create an unbounded stage queue with the given per-receive wait.
///
/// Flow control for frames comes from buffer-pool exhaustion upstream, so
/// frame queues are unbounded by default.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{RecvOutcome, stage_queue};
/// use std::time::Duration;
///
/// let (tx, rx) = stage_queue::<u8>(Duration::from_millis(5));
/// let _ = tx.send(7);
/// assert!(matches!(rx.recv_wait(), RecvOutcome::Data(7)));
/// assert!(matches!(rx.recv_wait(), RecvOutcome::Empty));
/// ```
pub fn stage_queue<T>(wait: Duration) -> (StageTx<T>, StageRx<T>) {
    make_queue(None, wait)
}

/// Create a capacity-bounded stage queue; `send` returns `Full` at capacity.
pub fn stage_queue_bounded<T>(capacity: usize, wait: Duration) -> (StageTx<T>, StageRx<T>) {
    make_queue(Some(capacity), wait)
}

fn make_queue<T>(capacity: Option<usize>, wait: Duration) -> (StageTx<T>, StageRx<T>) {
    let inner = Arc::new(QueueInner {
        items: Mutex::new(VecDeque::new()),
        cond: Condvar::new(),
        closed: AtomicBool::new(false),
        capacity,
        wait,
    });
    (
        StageTx {
            inner: inner.clone(),
        },
        StageRx { inner },
    )
}
