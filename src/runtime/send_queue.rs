//! Outbound send queue.
//!
//! Handlers enqueue replies here; one sender thread drains them. The queue
//! is bounded globally and per connection. The global cap simply drops
//! the message. The per-connection cap also reports the connection as
//! abusive: a peer that never reads its replies keeps them piling up
//! here, and the caller is expected to tear it down once the queue lock
//! has been released.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::runtime::connection::Connection;
use crate::runtime::sync::Semaphore;
use crate::runtime::wire::Message;

/// Most messages the queue holds across all connections.
pub const MAX_QUEUED: usize = 50_000;

/// Most messages the queue holds for a single connection.
pub const MAX_QUEUED_PER_CONN: usize = 400;

/// What happened to an enqueued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Dropped because the whole queue is full.
    DroppedFull,
    /// Dropped because the connection already has too much queued. The
    /// connection should be closed.
    Abusive,
    /// Not queued because the connection it was meant for is gone.
    Stale,
}

pub struct SendQueue {
    queue: Mutex<VecDeque<Message>>,
    len: AtomicUsize,
    discarded: AtomicU64,
    signal: Semaphore,
    max_queued: usize,
    max_per_conn: usize,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::with_caps(MAX_QUEUED, MAX_QUEUED_PER_CONN)
    }
}

impl SendQueue {
    pub fn with_caps(max_queued: usize, max_per_conn: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            discarded: AtomicU64::new(0),
            signal: Semaphore::new(0),
            max_queued,
            max_per_conn,
        }
    }

    /// Queue `msg` for `conn`, which must be the connection named by the
    /// message's origin.
    pub fn enqueue(&self, msg: Message, conn: &Connection) -> Enqueue {
        let mut queue = self.queue.lock();

        if queue.len() >= self.max_queued {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return Enqueue::DroppedFull;
        }
        if conn.queued_sends() >= self.max_per_conn {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Abusive;
        }

        queue.push_back(msg);
        conn.inc_queued_sends();
        self.len.store(queue.len(), Ordering::Release);
        drop(queue);

        self.signal.post();
        Enqueue::Queued
    }

    /// Pass every queued message to `f` once, in order, with the queue
    /// locked. Messages `f` hands back stay queued in enqueue
    /// order; everything else is consumed.
    pub fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(Message) -> Option<Message>,
    {
        let mut queue = self.queue.lock();
        let mut kept = VecDeque::new();
        let mut consumed = 0;

        while let Some(msg) = queue.pop_front() {
            match f(msg) {
                Some(msg) => kept.push_back(msg),
                None => consumed += 1,
            }
        }

        *queue = kept;
        self.len.store(queue.len(), Ordering::Release);
        consumed
    }

    /// Block the sender until something may be ready to send.
    pub fn wait(&self) {
        self.signal.wait();
    }

    /// Wake the sender without queuing anything, so it re-scans messages
    /// that were held back for a write-blocked connection.
    pub fn notify(&self) {
        self.signal.post();
    }

    /// Drop everything still queued.
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

    /// Messages rejected by either cap since startup.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::ConnRef;

    fn conn(index: usize) -> (ConnRef, Connection) {
        let conn = Connection::new(index, 1000);
        let r = conn.reset_for_lease(None);
        (r, conn)
    }

    #[test]
    fn test_global_cap_holds() {
        let queue = SendQueue::with_caps(3, 100);
        let (r, c) = conn(0);

        for _ in 0..3 {
            assert_eq!(queue.enqueue(Message::empty(r, 0), &c), Enqueue::Queued);
        }
        assert_eq!(queue.enqueue(Message::empty(r, 0), &c), Enqueue::DroppedFull);
        assert_eq!(queue.len(), 3);
        assert_eq!(c.queued_sends(), 3);
        assert_eq!(queue.discarded(), 1);
    }

    #[test]
    fn test_per_connection_cap_flags_abuse() {
        let queue = SendQueue::default();
        let (ra, a) = conn(0);
        let (rb, b) = conn(1);

        for _ in 0..MAX_QUEUED_PER_CONN {
            assert_eq!(queue.enqueue(Message::empty(ra, 0), &a), Enqueue::Queued);
        }
        assert_eq!(queue.enqueue(Message::empty(ra, 0), &a), Enqueue::Abusive);
        assert_eq!(a.queued_sends(), MAX_QUEUED_PER_CONN);

        // other connections are unaffected
        assert_eq!(queue.enqueue(Message::empty(rb, 0), &b), Enqueue::Queued);
        assert_eq!(queue.len(), MAX_QUEUED_PER_CONN + 1);
    }

    #[test]
    fn test_drain_keeps_returned_messages_in_order() {
        let queue = SendQueue::default();
        let (r, c) = conn(0);
        for code in 0..5u16 {
            queue.enqueue(Message::empty(r, code), &c);
        }

        let mut seen = Vec::new();
        let consumed = queue.drain(|msg| {
            seen.push(msg.code());
            if msg.code() % 2 == 1 {
                Some(msg)
            } else {
                None
            }
        });
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(consumed, 3);
        assert_eq!(queue.len(), 2);

        let mut left = Vec::new();
        queue.drain(|msg| {
            left.push(msg.code());
            None
        });
        assert_eq!(left, vec![1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_signals_sender() {
        let queue = SendQueue::default();
        let (r, c) = conn(0);
        queue.enqueue(Message::empty(r, 0), &c);
        queue.notify();
        queue.wait();
        queue.wait();
        assert_eq!(queue.clear(), 1);
    }
}
