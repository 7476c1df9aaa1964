//! mio event loop implementation.
//!
//! One thread owns the `Poll` and does all socket reads. Each read asks for
//! exactly what the framer still needs, so reads never straddle two packets.
//!
//! mio delivers edge-triggered readiness, but a connection only gets
//! [`READ_BUDGET`] reads per turn. One that still has data after that goes
//! on a backlog, and while the backlog is non-empty the loop polls without
//! blocking and serves it again next turn. A peer that writes faster than
//! we read therefore cannot hold the thread away from other sockets.
//!
//! Writes mostly happen on the sender thread. The loop only finishes sends
//! that were parked on a full socket buffer.

use mio::event::Event;
use mio::{Events, Poll, Token};
use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::listener::Listener;
use crate::runtime::connection::{ConnRef, Connection, RecvState};
use crate::runtime::engine::Engine;
use crate::runtime::framer::Progress;
use crate::runtime::pool::Admission;

pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Interval of the statistics line, which also bounds each poll.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

const EVENTS_CAPACITY: usize = 1024;

/// Reads one connection may do per turn before yielding.
const READ_BUDGET: usize = 16;

/// Token for the listener at `position`, counted down from just below the
/// waker so it can never collide with a pool slot.
pub(crate) fn listener_token(position: usize) -> Token {
    Token(usize::MAX - 1 - position)
}

fn listener_position(token: Token, listeners: usize) -> Option<usize> {
    let position = (usize::MAX - 1).checked_sub(token.0)?;
    (position < listeners).then_some(position)
}

/// Run until the engine is shut down.
pub(crate) fn run(engine: Arc<Engine>, poll: Poll, listeners: Vec<Listener>) {
    let mut event_loop = EventLoop::new(engine, poll, listeners);
    let mut last_stats = Instant::now();

    info!(listeners = event_loop.listeners.len(), "Event loop started");

    while !event_loop.engine.is_shutting_down() {
        if let Err(e) = event_loop.turn() {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Poll failed");
            event_loop.engine.begin_shutdown();
            break;
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            event_loop.engine.log_stats();
            last_stats = Instant::now();
        }
    }

    for listener in event_loop.listeners {
        info!(port = listener.port(), "Closing listening socket");
    }
    info!("Event loop stopped");
}

struct EventLoop {
    engine: Arc<Engine>,
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    /// Connections that spent their read budget with data still waiting.
    backlog: HashSet<ConnRef>,
}

impl EventLoop {
    fn new(engine: Arc<Engine>, poll: Poll, listeners: Vec<Listener>) -> Self {
        Self {
            engine,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
            backlog: HashSet::new(),
        }
    }

    /// Poll once, handle every event, then give backlogged connections
    /// another budget.
    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.backlog.is_empty() {
            STATS_INTERVAL
        } else {
            Duration::ZERO
        };
        self.poll.poll(&mut self.events, Some(timeout))?;

        let carried: Vec<ConnRef> = self.backlog.drain().collect();

        for event in self.events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                token => match listener_position(token, self.listeners.len()) {
                    Some(position) => accept_connections(&self.engine, &mut self.listeners[position]),
                    None => {
                        if let Some(r) = handle_connection_event(&self.engine, token.0, event) {
                            self.backlog.insert(r);
                        }
                    }
                },
            }
        }

        for r in carried {
            // a fresh event already served it this turn
            if self.backlog.contains(&r) {
                continue;
            }
            let Some(conn) = self.engine.pool().resolve(r) else {
                continue;
            };
            if handle_readable(&self.engine, &conn) {
                self.backlog.insert(r);
            }
        }

        Ok(())
    }
}

fn accept_connections(engine: &Engine, listener: &mut Listener) {
    let ceiling = engine.config().worker_connections;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => match engine.pool().admit(ceiling) {
                Admission::Accept => {
                    engine.open_connection(stream, peer);
                }
                Admission::AtCapacity => {
                    warn!(peer = %peer, online = engine.pool().online(), ceiling, "Connection limit reached");
                }
                Admission::Churn => {
                    let stats = engine.pool().stats();
                    warn!(
                        peer = %peer,
                        pool_total = stats.total,
                        pool_free = stats.free,
                        "Too many connections waiting on recycling, rejecting"
                    );
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => match e.raw_os_error() {
                Some(libc::ECONNABORTED) => {
                    warn!(port = listener.port(), "Peer aborted before accept");
                }
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    error!(port = listener.port(), error = %e, "Out of file descriptors");
                    break;
                }
                _ => {
                    error!(port = listener.port(), error = %e, "Accept failed");
                    break;
                }
            },
        }
    }
}

/// Serve one readiness event. Returns the connection if it ran out of
/// read budget before draining its socket.
fn handle_connection_event(engine: &Engine, index: usize, event: &Event) -> Option<ConnRef> {
    let conn = engine.pool().get(index)?;
    if !conn.is_open() {
        return None;
    }
    let conn_ref = conn.conn_ref();

    let mut unread = false;
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        unread = handle_readable(engine, &conn);
    }

    if !conn.is_open() {
        return None;
    }

    if event.is_writable() {
        if event.is_error() || event.is_write_closed() {
            engine.abandon_send(&conn);
        } else {
            engine.resume_send(&conn);
        }
    }

    unread.then_some(conn_ref)
}

/// Outcome of a single read.
enum ReadStep {
    More,
    Drained,
    Close,
}

/// Read until the socket is drained or the budget is spent. Returns
/// whether data may still be waiting.
fn handle_readable(engine: &Engine, conn: &Connection) -> bool {
    for _ in 0..READ_BUDGET {
        match read_once(engine, conn) {
            ReadStep::More => {}
            ReadStep::Drained => return false,
            ReadStep::Close => {
                engine.close_connection(conn);
                return false;
            }
        }
    }
    conn.is_open()
}

/// Read what the framer asks for and feed it in.
fn read_once(engine: &Engine, conn: &Connection) -> ReadStep {
    // epoch before socket: a close that lands in between leaves the packet stale
    let origin = conn.conn_ref();
    let Some(stream) = conn.stream() else {
        return ReadStep::Drained;
    };

    let mut recv = conn.recv();
    let RecvState { framer, flood } = &mut *recv;

    let n = match (&*stream).read(framer.read_buf()) {
        Ok(0) => {
            debug!(conn = origin.index(), "Peer closed connection");
            return ReadStep::Close;
        }
        Ok(n) => n,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStep::Drained,
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return ReadStep::More,
        Err(e) => {
            match e.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    debug!(conn = origin.index(), error = %e, "Connection reset")
                }
                _ => warn!(conn = origin.index(), error = %e, "Read failed"),
            }
            return ReadStep::Close;
        }
    };

    match framer.advance(n, origin) {
        Progress::Partial => ReadStep::More,
        Progress::Rejected { total_len } => {
            debug!(conn = origin.index(), total_len, "Bad packet length, resetting");
            ReadStep::More
        }
        Progress::Complete(msg) => {
            if let Some(guard) = engine.flood_guard() {
                if guard.check(flood, Instant::now()) {
                    warn!(
                        conn = origin.index(),
                        peer = ?conn.peer(),
                        fast_packets = flood.fast_packets(),
                        "Flood detected, closing connection"
                    );
                    return ReadStep::Close;
                }
            }

            drop(recv);
            trace!(conn = origin.index(), code = msg.code(), "Packet received");
            engine.inbound().push(msg);
            ReadStep::More
        }
    }
}
