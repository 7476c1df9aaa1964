//! Per-connection state.
//!
//! A [`Connection`] is a reusable slot in the connection pool. The slot
//! outlives any single peer: when a peer goes away the slot is recycled and
//! later handed to a new peer. Every such hand-over bumps the slot's epoch,
//! and everything that refers to a connection from another thread (queued
//! messages, heartbeat timers) carries a [`ConnRef`] with the epoch it saw.
//! A reference whose epoch no longer matches belongs to a previous occupant
//! and must be dropped instead of acted upon.

use mio::net::TcpStream;
use parking_lot::{Mutex, MutexGuard};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::runtime::flood::FloodTracker;
use crate::runtime::framer::Framer;
use crate::runtime::wire::Message;

/// Generational reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnRef {
    index: usize,
    epoch: u64,
}

impl ConnRef {
    pub fn new(index: usize, epoch: u64) -> Self {
        Self { index, epoch }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// On the free list.
    Free,
    /// Handed to an accepted socket, not yet registered for readiness.
    Leased,
    /// Registered and serving a peer.
    Active,
    /// Socket closed, waiting out the grace period before reuse.
    PendingRecycle,
}

/// Receive-side state, only touched by the event loop thread.
pub struct RecvState {
    pub framer: Framer,
    pub flood: FloodTracker,
}

/// An outbound packet that did not fit in the socket buffer.
#[derive(Debug)]
pub struct PendingSend {
    msg: Message,
    written: usize,
}

impl PendingSend {
    pub fn new(msg: Message, written: usize) -> Self {
        Self { msg, written }
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.msg.as_bytes()[self.written..]
    }

    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.msg.as_bytes().len());
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.msg.as_bytes().len()
    }
}

/// State guarded by the per-connection logic lock.
///
/// Handlers take this lock before touching anything tied to the peer, which
/// serializes concurrent handler invocations for the same connection
/// without involving any pool-wide lock.
#[derive(Debug)]
pub struct Session {
    pub last_heartbeat: Instant,
}

/// A single client connection slot.
pub struct Connection {
    index: usize,
    epoch: AtomicU64,
    stream: Mutex<Option<Arc<TcpStream>>>,
    peer: Mutex<Option<SocketAddr>>,
    recv: Mutex<RecvState>,
    send: Mutex<Option<PendingSend>>,
    /// Nonzero while the socket's send buffer is full and draining depends
    /// on a writable readiness event.
    blocked_sends: AtomicU32,
    /// Entries for this connection waiting in the send queue.
    queued_sends: AtomicUsize,
    session: Mutex<Session>,
}

impl Connection {
    /// Create an unused slot.
    pub fn new(index: usize, max_packet_length: usize) -> Self {
        Self {
            index,
            epoch: AtomicU64::new(0),
            stream: Mutex::new(None),
            peer: Mutex::new(None),
            recv: Mutex::new(RecvState {
                framer: Framer::new(max_packet_length),
                flood: FloodTracker::default(),
            }),
            send: Mutex::new(None),
            blocked_sends: AtomicU32::new(0),
            queued_sends: AtomicUsize::new(0),
            session: Mutex::new(Session {
                last_heartbeat: Instant::now(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Reference valid for the current occupant only.
    pub fn conn_ref(&self) -> ConnRef {
        ConnRef::new(self.index, self.epoch())
    }

    /// Whether `r` still names the current occupant of this slot.
    pub fn is_current(&self, r: ConnRef) -> bool {
        r.index == self.index && r.epoch == self.epoch()
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Shared handle to the socket, if the connection is still open.
    pub fn stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.lock().as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Detach the socket. The descriptor closes once the last in-flight
    /// user drops its handle.
    pub(crate) fn take_stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().take()
    }

    pub fn recv(&self) -> MutexGuard<'_, RecvState> {
        self.recv.lock()
    }

    pub fn pending_send(&self) -> MutexGuard<'_, Option<PendingSend>> {
        self.send.lock()
    }

    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn is_write_blocked(&self) -> bool {
        self.blocked_sends.load(Ordering::Acquire) > 0
    }

    pub fn blocked_sends(&self) -> u32 {
        self.blocked_sends.load(Ordering::Acquire)
    }

    pub(crate) fn mark_write_blocked(&self) {
        self.blocked_sends.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the blocked counter without going below zero.
    pub(crate) fn clear_write_blocked(&self) {
        let _ = self
            .blocked_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn queued_sends(&self) -> usize {
        self.queued_sends.load(Ordering::Acquire)
    }

    pub(crate) fn inc_queued_sends(&self) {
        self.queued_sends.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_queued_sends(&self) {
        let _ = self
            .queued_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Prepare the slot for a new peer. Called with the pool lock held.
    pub(crate) fn reset_for_lease(&self, stream: Option<(TcpStream, SocketAddr)>) -> ConnRef {
        self.bump_epoch();

        {
            let mut recv = self.recv.lock();
            recv.framer.reset();
            recv.flood = FloodTracker::default();
        }
        *self.send.lock() = None;
        self.blocked_sends.store(0, Ordering::Release);
        self.queued_sends.store(0, Ordering::Release);
        self.session.lock().last_heartbeat = Instant::now();

        let (stream, peer) = match stream {
            Some((stream, peer)) => (Some(Arc::new(stream)), Some(peer)),
            None => (None, None),
        };
        *self.stream.lock() = stream;
        *self.peer.lock() = peer;

        self.conn_ref()
    }

    /// Drop every buffer still attached to the slot before it goes back on
    /// the free list.
    pub(crate) fn reset_for_release(&self) {
        self.bump_epoch();
        self.recv.lock().framer.reset();
        *self.send.lock() = None;
        self.blocked_sends.store(0, Ordering::Release);
        self.stream.lock().take();
        self.peer.lock().take();
    }
}
