//! Connection pool with delayed recycling.
//!
//! Slots are allocated on demand and never shrink while the process runs.
//! A connection that goes away is not returned to the free list right away:
//! its epoch is bumped immediately, so everything in flight for the old
//! peer turns stale, and the slot sits on the pending-recycle list for a
//! grace period. That gives worker threads that already dequeued a message
//! for the old peer time to notice the epoch change before the buffers they
//! might touch are reset for someone else.

use mio::net::TcpStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::runtime::connection::{ConnRef, Connection, Lifecycle};

struct Slot {
    conn: Arc<Connection>,
    state: Lifecycle,
    recycle_at: Option<Instant>,
}

struct PoolInner {
    /// Every slot ever allocated, indexed by `Connection::index`.
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    pending_recycle: VecDeque<usize>,
}

/// Result of admission control for a freshly accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Online connections reached the configured ceiling.
    AtCapacity,
    /// The pool grew far beyond the ceiling while free slots ran short,
    /// which is what rapid connect/disconnect churn looks like.
    Churn,
}

/// Snapshot for the periodic statistics line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub pending_recycle: usize,
    pub online: usize,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    online: AtomicUsize,
    max_packet_length: usize,
    grace: Duration,
}

impl ConnectionPool {
    /// Create a pool with `prealloc` free slots.
    pub fn new(prealloc: usize, max_packet_length: usize, grace: Duration) -> Self {
        let slots = (0..prealloc)
            .map(|index| Slot {
                conn: Arc::new(Connection::new(index, max_packet_length)),
                state: Lifecycle::Free,
                recycle_at: None,
            })
            .collect();

        Self {
            inner: Mutex::new(PoolInner {
                slots,
                free: (0..prealloc).collect(),
                pending_recycle: VecDeque::new(),
            }),
            online: AtomicUsize::new(0),
            max_packet_length,
            grace,
        }
    }

    /// Take a free slot, growing the pool if none is available.
    pub fn lease(&self, stream: Option<(TcpStream, SocketAddr)>) -> (ConnRef, Arc<Connection>) {
        let mut inner = self.inner.lock();

        let index = match inner.free.pop_front() {
            Some(index) => index,
            None => {
                let index = inner.slots.len();
                inner.slots.push(Slot {
                    conn: Arc::new(Connection::new(index, self.max_packet_length)),
                    state: Lifecycle::Free,
                    recycle_at: None,
                });
                debug!(conn = index, "Connection pool grew");
                index
            }
        };

        let slot = &mut inner.slots[index];
        slot.state = Lifecycle::Leased;
        slot.recycle_at = None;
        let conn_ref = slot.conn.reset_for_lease(stream);
        (conn_ref, Arc::clone(&slot.conn))
    }

    /// Mark a leased connection as serving its peer and count it online.
    pub fn mark_active(&self, r: ConnRef) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(r.index()) {
            Some(slot) if slot.state == Lifecycle::Leased && slot.conn.is_current(r) => {
                slot.state = Lifecycle::Active;
                self.online.fetch_add(1, Ordering::AcqRel);
                true
            }
            _ => false,
        }
    }

    /// Return a slot to the free list right away, dropping its buffers.
    ///
    /// Only safe once nothing in flight can still refer to the slot's
    /// previous epoch, which is why teardown of a serving connection goes
    /// through [`ConnectionPool::schedule_recycle`] instead.
    pub fn release(&self, conn: &Connection) {
        let mut inner = self.inner.lock();
        let index = conn.index();
        if let Some(pos) = inner.pending_recycle.iter().position(|&i| i == index) {
            inner.pending_recycle.remove(pos);
        }
        Self::release_locked(&mut inner, index);
    }

    fn release_locked(inner: &mut PoolInner, index: usize) {
        let Some(slot) = inner.slots.get_mut(index) else {
            return;
        };
        if slot.state == Lifecycle::Free {
            return;
        }

        slot.conn.reset_for_release();
        slot.state = Lifecycle::Free;
        slot.recycle_at = None;
        inner.free.push_back(index);
    }

    /// Queue a connection for delayed release. Idempotent.
    ///
    /// The epoch is bumped here, so every reference held for the current
    /// peer is stale from this point on even though the slot itself is only
    /// reclaimed after the grace period.
    pub fn schedule_recycle(&self, conn: &Connection) -> bool {
        self.schedule_recycle_at(conn, Instant::now())
    }

    pub(crate) fn schedule_recycle_at(&self, conn: &Connection, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let index = conn.index();
        let Some(slot) = inner.slots.get_mut(index) else {
            return false;
        };

        match slot.state {
            Lifecycle::PendingRecycle | Lifecycle::Free => return false,
            Lifecycle::Active => {
                self.online.fetch_sub(1, Ordering::AcqRel);
            }
            Lifecycle::Leased => {}
        }

        slot.state = Lifecycle::PendingRecycle;
        slot.recycle_at = Some(now);
        slot.conn.bump_epoch();
        inner.pending_recycle.push_back(index);
        true
    }

    /// Release every pending connection whose grace period is over, or all
    /// of them when `force` is set. Returns how many were released.
    pub fn sweep(&self, now: Instant, force: bool) -> usize {
        let mut inner = self.inner.lock();
        if inner.pending_recycle.is_empty() {
            return 0;
        }

        let grace = self.grace;
        let (due, waiting): (Vec<usize>, Vec<usize>) =
            inner.pending_recycle.iter().partition(|&&index| {
                force
                    || inner.slots[index]
                        .recycle_at
                        .map(|at| at + grace <= now)
                        .unwrap_or(true)
            });
        inner.pending_recycle = waiting.into();

        for &index in &due {
            let conn = &inner.slots[index].conn;
            if conn.is_write_blocked() {
                warn!(
                    conn = index,
                    blocked = conn.blocked_sends(),
                    "Recycling a connection that is still write-blocked"
                );
            }
            Self::release_locked(&mut inner, index);
        }

        due.len()
    }

    /// The slot at `index`, whoever currently occupies it.
    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .slots
            .get(index)
            .map(|slot| Arc::clone(&slot.conn))
    }

    /// The slot named by `r`, only if `r` still refers to its occupant
    /// and that occupant has not been closed.
    pub fn resolve(&self, r: ConnRef) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(r.index())?;
        let live = matches!(slot.state, Lifecycle::Leased | Lifecycle::Active);
        (live && slot.conn.is_current(r)).then(|| Arc::clone(&slot.conn))
    }

    #[cfg(test)]
    pub fn lifecycle(&self, index: usize) -> Option<Lifecycle> {
        self.inner.lock().slots.get(index).map(|slot| slot.state)
    }

    /// Admission control for a freshly accepted socket.
    pub fn admit(&self, ceiling: usize) -> Admission {
        if self.online() >= ceiling {
            return Admission::AtCapacity;
        }

        let inner = self.inner.lock();
        if inner.slots.len() > ceiling.saturating_mul(5) && inner.free.len() < ceiling {
            return Admission::Churn;
        }
        Admission::Accept
    }

    pub fn online(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    /// Connections currently occupied by a peer or still waiting on
    /// recycling.
    pub fn in_use(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|slot| slot.state != Lifecycle::Free)
            .map(|slot| Arc::clone(&slot.conn))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total: inner.slots.len(),
            free: inner.free.len(),
            pending_recycle: inner.pending_recycle.len(),
            online: self.online(),
        }
    }
}
