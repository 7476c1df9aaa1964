//! Inbound work queue and the worker threads that drain it.
//!
//! The event loop pushes every completed packet here; a fixed set of
//! worker threads pops them and runs the dispatcher. Idle workers sleep on
//! a condition variable.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::runtime::engine::Engine;
use crate::runtime::wire::Message;

/// Minimum time between two "all workers busy" warnings.
const BUSY_WARN_INTERVAL: Duration = Duration::from_secs(10);

pub struct InboundQueue {
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
    len: AtomicUsize,
    closed: AtomicBool,
    /// Workers currently running a handler.
    busy: AtomicUsize,
    workers: usize,
    last_busy_warn: Mutex<Option<Instant>>,
}

impl InboundQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            workers,
            last_busy_warn: Mutex::new(None),
        }
    }

    /// Queue a packet and wake one idle worker.
    pub fn push(&self, msg: Message) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(msg);
            self.len.store(queue.len(), Ordering::Release);
        }
        self.ready.notify_one();

        if self.all_busy() && self.should_warn_busy(Instant::now()) {
            warn!(
                workers = self.workers,
                queued = self.len(),
                "All workers are busy, consider raising worker_threads"
            );
        }
    }

    /// Block until a packet is available. Returns `None` once the queue
    /// has been closed.
    pub fn pop(&self) -> Option<Message> {
        let mut queue = self.queue.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(msg) = queue.pop_front() {
                self.len.store(queue.len(), Ordering::Release);
                self.busy.fetch_add(1, Ordering::AcqRel);
                return Some(msg);
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Called by a worker once it is done with a packet from [`pop`].
    ///
    /// [`pop`]: InboundQueue::pop
    pub fn finish(&self) {
        let _ = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Wake every worker and make further pops return `None`.
    pub fn close(&self) {
        let _queue = self.queue.lock();
        self.closed.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        self.len.store(0, Ordering::Release);
        dropped
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    fn all_busy(&self) -> bool {
        self.busy() >= self.workers
    }

    fn should_warn_busy(&self, now: Instant) -> bool {
        let mut last = self.last_busy_warn.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < BUSY_WARN_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Handles of the running worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers draining the engine's inbound queue.
    pub fn spawn(engine: &Arc<Engine>, count: usize) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);

        for worker_id in 0..count {
            let engine = Arc::clone(engine);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, engine))?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

fn worker_loop(worker_id: usize, engine: Arc<Engine>) {
    debug!(worker = worker_id, "Worker started");

    while let Some(msg) = engine.inbound().pop() {
        engine.dispatch(msg);
        engine.inbound().finish();
    }

    debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::ConnRef;

    fn msg(code: u16) -> Message {
        Message::empty(ConnRef::new(0, 1), code)
    }

    #[test]
    fn test_fifo_order() {
        let queue = InboundQueue::new(2);
        for code in 0..3 {
            queue.push(msg(code));
        }
        assert_eq!(queue.len(), 3);

        let codes: Vec<u16> = (0..3).filter_map(|_| queue.pop()).map(|m| m.code()).collect();
        assert_eq!(codes, vec![0, 1, 2]);
        assert_eq!(queue.busy(), 3);
        assert!(queue.is_empty());

        queue.finish();
        assert_eq!(queue.busy(), 2);
    }

    #[test]
    fn test_close_wakes_idle_workers() {
        let queue = Arc::new(InboundQueue::new(2));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop().is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.close();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_push_wakes_a_worker() {
        let queue = Arc::new(InboundQueue::new(1));
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().map(|m| m.code()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(msg(6));
        assert_eq!(worker.join().unwrap(), Some(6));
    }

    #[test]
    fn test_busy_warning_is_rate_limited() {
        let queue = InboundQueue::new(1);
        let now = Instant::now();
        assert!(queue.should_warn_busy(now));
        assert!(!queue.should_warn_busy(now + Duration::from_secs(1)));
        assert!(queue.should_warn_busy(now + BUSY_WARN_INTERVAL));

        queue.push(msg(0));
        queue.pop();
        assert!(queue.all_busy());
        queue.finish();
        queue.finish();
        assert_eq!(queue.busy(), 0);
    }
}
