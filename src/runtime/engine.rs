//! State shared by every thread of a running server.
//!
//! The event loop owns the `Poll`; everything else reaches the
//! multiplexer through a cloned `Registry`, which is what lets the sender
//! thread switch a connection to writable interest while the event loop is
//! blocked in `poll`.
//!
//! Besides the shared state this module runs the three service threads:
//! the sender, the recycle sweep and the heartbeat monitor.

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token, Waker};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::runtime::connection::{ConnRef, Connection, PendingSend};
use crate::runtime::dispatch::{Dispatched, Dispatcher};
use crate::runtime::flood::FloodGuard;
use crate::runtime::pool::ConnectionPool;
use crate::runtime::send_queue::{Enqueue, SendQueue};
use crate::runtime::timer::TimerQueue;
use crate::runtime::wire::Message;
use crate::runtime::workers::InboundQueue;

/// How often the recycle thread sweeps pending connections.
const RECYCLE_INTERVAL: Duration = Duration::from_millis(200);

/// How often the heartbeat monitor looks at the timer queue.
const TIMER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inbound backlog above which the statistics line turns into a warning.
const INBOUND_BACKLOG_WARN: usize = 100_000;

pub struct Engine {
    config: Config,
    pool: ConnectionPool,
    send_queue: SendQueue,
    timers: TimerQueue,
    inbound: InboundQueue,
    flood: Option<FloodGuard>,
    dispatcher: Dispatcher,
    registry: Registry,
    waker: Waker,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new(config: Config, dispatcher: Dispatcher, registry: Registry, waker: Waker) -> Self {
        let flood = config
            .flood_enabled
            .then(|| FloodGuard::new(config.flood_interval, config.flood_kick_count));

        Self {
            pool: ConnectionPool::new(
                config.worker_connections,
                config.max_packet_length,
                config.recycle_wait,
            ),
            send_queue: SendQueue::default(),
            timers: TimerQueue::new(config.heartbeat_interval, config.timeout_kick),
            inbound: InboundQueue::new(config.worker_threads),
            flood,
            dispatcher,
            registry,
            waker,
            shutdown: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn send_queue(&self) -> &SendQueue {
        &self.send_queue
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub fn flood_guard(&self) -> Option<&FloodGuard> {
        self.flood.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask every thread to stop. Safe to call more than once.
    pub fn begin_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down");

        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
        self.send_queue.notify();
        self.inbound.close();
    }

    fn set_interest(&self, conn: &Connection, interest: Interest, first: bool) -> io::Result<()> {
        let fd = conn
            .raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        let token = Token(conn.index());
        if first {
            self.registry.register(&mut SourceFd(&fd), token, interest)
        } else {
            self.registry.reregister(&mut SourceFd(&fd), token, interest)
        }
    }

    /// Take an accepted socket into the pool and start watching it.
    ///
    /// If the socket cannot be registered the slot goes straight back to
    /// the free list and the socket is closed.
    pub fn open_connection(&self, stream: TcpStream, peer: SocketAddr) -> Option<ConnRef> {
        let (conn_ref, conn) = self.pool.lease(Some((stream, peer)));

        if let Err(e) = self.set_interest(&conn, Interest::READABLE, true) {
            error!(conn = conn_ref.index(), peer = %peer, error = %e, "Failed to register connection");
            self.pool.release(&conn);
            return None;
        }

        if self.config.heartbeat_enabled {
            self.timers.add(conn_ref, Instant::now());
        }
        self.pool.mark_active(conn_ref);

        debug!(
            conn = conn_ref.index(),
            epoch = conn_ref.epoch(),
            peer = %peer,
            "Accepted connection"
        );
        Some(conn_ref)
    }

    /// Tear down a connection: stop watching it, close the socket and
    /// schedule the slot for recycling. Calling it again is harmless.
    pub fn close_connection(&self, conn: &Connection) {
        if self.config.heartbeat_enabled {
            self.timers.remove_all_for(conn.index());
        }

        if let Some(stream) = conn.take_stream() {
            let fd = stream.as_raw_fd();
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                trace!(conn = conn.index(), error = %e, "Deregister failed");
            }
            debug!(conn = conn.index(), peer = ?conn.peer(), "Connection closed");
        }

        if conn.is_write_blocked() {
            conn.clear_write_blocked();
        }
        self.pool.schedule_recycle(conn);
    }

    /// Queue a reply for the connection named by the message's origin.
    pub fn send(&self, msg: Message) -> Enqueue {
        let origin = msg.origin();
        let Some(conn) = self.pool.resolve(origin) else {
            trace!(conn = origin.index(), "Dropping reply for a stale connection");
            return Enqueue::Stale;
        };

        let outcome = self.send_queue.enqueue(msg, &conn);
        match outcome {
            Enqueue::Queued | Enqueue::Stale => {}
            Enqueue::DroppedFull => {
                debug!(conn = origin.index(), "Send queue full, dropping reply");
            }
            Enqueue::Abusive => {
                warn!(
                    conn = origin.index(),
                    peer = ?conn.peer(),
                    queued = conn.queued_sends(),
                    "Peer is not draining its replies, closing connection"
                );
                self.close_connection(&conn);
            }
        }
        outcome
    }

    /// Run a completed inbound packet through the dispatcher.
    pub fn dispatch(&self, msg: Message) -> Dispatched {
        self.dispatcher.dispatch(self, msg)
    }

    /// One pass of the sender over the whole send queue.
    pub fn flush_send_queue(&self) -> usize {
        self.send_queue.drain(|msg| {
            let Some(conn) = self.pool.resolve(msg.origin()) else {
                return None;
            };
            if conn.is_write_blocked() {
                return Some(msg);
            }

            conn.dec_queued_sends();
            self.write_or_park(&conn, msg);
            None
        })
    }

    fn write_or_park(&self, conn: &Connection, msg: Message) {
        let Some(stream) = conn.stream() else {
            return;
        };

        let len = msg.as_bytes().len();
        loop {
            match (&*stream).write(msg.as_bytes()) {
                Ok(n) if n == len => return,
                Ok(0) => {
                    warn!(conn = conn.index(), "send wrote nothing, waiting for writable");
                    self.park(conn, msg, 0);
                    return;
                }
                Ok(n) => {
                    self.park(conn, msg, n);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.park(conn, msg, 0);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // the read side notices a broken peer and tears it down
                    debug!(conn = conn.index(), error = %e, "Send failed, dropping reply");
                    return;
                }
            }
        }
    }

    /// Keep the unsent tail of `msg` on the connection and wait for the
    /// socket to become writable.
    fn park(&self, conn: &Connection, msg: Message, written: usize) {
        {
            let mut pending = conn.pending_send();
            conn.mark_write_blocked();
            *pending = Some(PendingSend::new(msg, written));
        }

        if let Err(e) = self.set_interest(conn, Interest::READABLE | Interest::WRITABLE, false) {
            debug!(conn = conn.index(), error = %e, "Failed to watch for writable");
            conn.pending_send().take();
            conn.clear_write_blocked();
        }
    }

    /// Continue a parked send after the socket became writable.
    ///
    /// Once the tail is flushed the connection goes back to read interest
    /// only and the sender is woken to look at messages it held back.
    pub fn resume_send(&self, conn: &Connection) {
        let Some(stream) = conn.stream() else {
            return;
        };

        let mut pending = conn.pending_send();
        let Some(send) = pending.as_mut() else {
            return;
        };

        while !send.is_done() {
            match (&*stream).write(send.remaining()) {
                Ok(0) => {
                    warn!(conn = conn.index(), "send wrote nothing, waiting for writable");
                    return;
                }
                Ok(n) => send.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = conn.index(), error = %e, "Send failed, dropping reply");
                    break;
                }
            }
        }

        *pending = None;
        drop(pending);

        if let Err(e) = self.set_interest(conn, Interest::READABLE, false) {
            debug!(conn = conn.index(), error = %e, "Failed to drop writable interest");
        }
        conn.clear_write_blocked();
        self.send_queue.notify();
    }

    /// Give up on a parked send because the socket reported an error or
    /// hang-up. Teardown is left to the read path.
    pub fn abandon_send(&self, conn: &Connection) {
        if conn.pending_send().take().is_some() {
            conn.clear_write_blocked();
            self.send_queue.notify();
        }
    }

    /// Apply the heartbeat policy to every timer due at `now`.
    pub fn check_timers(&self, now: Instant) {
        if !self.timers.may_have_expired(now) {
            return;
        }

        for conn_ref in self.timers.pop_expired(now) {
            match self.pool.resolve(conn_ref) {
                Some(conn) => self.dispatcher.heartbeat_timeout(self, &conn, now),
                None => trace!(conn = conn_ref.index(), "Dropping stale heartbeat timer"),
            }
        }
    }

    pub fn log_stats(&self) {
        let pool = self.pool.stats();
        let inbound = self.inbound.len();

        info!(
            online = pool.online,
            ceiling = self.config.worker_connections,
            pool_total = pool.total,
            pool_free = pool.free,
            pending_recycle = pool.pending_recycle,
            timers = self.timers.len(),
            inbound,
            outbound = self.send_queue.len(),
            discarded = self.send_queue.discarded(),
            "Server statistics"
        );

        if inbound > INBOUND_BACKLOG_WARN {
            warn!(inbound, "Inbound queue is backing up, workers cannot keep up");
        }
    }

    /// Close every remaining connection and drop everything still queued.
    /// Called once all threads have stopped.
    pub fn finish(&self) {
        for conn in self.pool.in_use() {
            self.close_connection(&conn);
        }
        let released = self.pool.sweep(Instant::now(), true);
        let unsent = self.send_queue.clear();
        let unprocessed = self.inbound.clear();
        self.timers.clear();

        info!(released, unsent, unprocessed, "Server stopped");
    }
}

/// Start the sender, recycle and heartbeat threads.
pub fn spawn_service_threads(engine: &Arc<Engine>) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(3);

    let sender = Arc::clone(engine);
    handles.push(
        thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || sender_loop(sender))?,
    );

    let recycler = Arc::clone(engine);
    handles.push(
        thread::Builder::new()
            .name("recycle".to_string())
            .spawn(move || recycle_loop(recycler))?,
    );

    if engine.config().heartbeat_enabled {
        let monitor = Arc::clone(engine);
        handles.push(
            thread::Builder::new()
                .name("heartbeat".to_string())
                .spawn(move || timer_loop(monitor))?,
        );
    }

    Ok(handles)
}

fn sender_loop(engine: Arc<Engine>) {
    debug!("Sender started");
    loop {
        engine.send_queue().wait();
        if engine.is_shutting_down() {
            break;
        }
        engine.flush_send_queue();
    }
    debug!("Sender stopped");
}

fn recycle_loop(engine: Arc<Engine>) {
    debug!("Recycle sweep started");
    while !engine.is_shutting_down() {
        thread::sleep(RECYCLE_INTERVAL);
        let released = engine.pool().sweep(Instant::now(), false);
        if released > 0 {
            trace!(released, "Recycled connections");
        }
    }

    let released = engine.pool().sweep(Instant::now(), true);
    debug!(released, "Recycle sweep stopped");
}

fn timer_loop(engine: Arc<Engine>) {
    debug!(interval = ?engine.timers().interval(), "Heartbeat monitor started");
    while !engine.is_shutting_down() {
        thread::sleep(TIMER_POLL_INTERVAL);
        engine.check_timers(Instant::now());
    }
    debug!("Heartbeat monitor stopped");
}
