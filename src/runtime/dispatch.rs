//! Message dispatch.
//!
//! Maps message codes to handlers and runs them on a worker thread. Before
//! a handler sees a packet it is checked twice: the body must match the
//! header checksum, and the connection it came from must still be the
//! same peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::runtime::connection::Connection;
use crate::runtime::engine::Engine;
use crate::runtime::wire::Message;

/// Business handler for one message code. The return value reports
/// whether the packet was well formed; it is only logged.
pub type Handler = Box<dyn Fn(&Engine, &Arc<Connection>, &Message) -> bool + Send + Sync>;

/// Decides what happens to a live connection whose heartbeat timer expired.
pub type TimeoutPolicy = Box<dyn Fn(&Engine, &Arc<Connection>, Instant) + Send + Sync>;

/// What the dispatcher did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran and returned this value.
    Handled(bool),
    BadChecksum,
    /// The connection went away or was reused after the packet arrived.
    Stale,
    /// No handler for this code.
    Unrouted,
}

pub struct Dispatcher {
    handlers: HashMap<u16, Handler>,
    on_timeout: TimeoutPolicy,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// An empty table. Expired heartbeat timers close the connection until
    /// another policy is installed.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_timeout: Box::new(|engine: &Engine, conn: &Arc<Connection>, _: Instant| {
                engine.close_connection(conn)
            }),
        }
    }

    /// Route `code` to `handler`, replacing any earlier route.
    pub fn route<F>(mut self, code: u16, handler: F) -> Self
    where
        F: Fn(&Engine, &Arc<Connection>, &Message) -> bool + Send + Sync + 'static,
    {
        self.handlers.insert(code, Box::new(handler));
        self
    }

    pub fn on_heartbeat_timeout<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Engine, &Arc<Connection>, Instant) + Send + Sync + 'static,
    {
        self.on_timeout = Box::new(policy);
        self
    }

    #[cfg(test)]
    pub fn routes(&self) -> usize {
        self.handlers.len()
    }

    /// Validate `msg` and hand it to its handler. The message is dropped
    /// when this returns, whatever the outcome.
    pub fn dispatch(&self, engine: &Engine, msg: Message) -> Dispatched {
        let origin = msg.origin();

        if !msg.checksum_ok() {
            debug!(
                conn = origin.index(),
                code = msg.code(),
                "Dropping packet with bad checksum"
            );
            return Dispatched::BadChecksum;
        }

        let Some(conn) = engine.pool().resolve(origin) else {
            trace!(conn = origin.index(), epoch = origin.epoch(), "Dropping stale packet");
            return Dispatched::Stale;
        };

        let Some(handler) = self.handlers.get(&msg.code()) else {
            warn!(conn = origin.index(), code = msg.code(), "No handler for message code");
            return Dispatched::Unrouted;
        };

        let ok = handler(engine, &conn, &msg);
        if !ok {
            debug!(conn = origin.index(), code = msg.code(), "Handler rejected packet");
        }
        Dispatched::Handled(ok)
    }

    /// Apply the heartbeat policy to a connection whose timer expired.
    pub fn heartbeat_timeout(&self, engine: &Engine, conn: &Arc<Connection>, now: Instant) {
        (self.on_timeout)(engine, conn, now)
    }
}
