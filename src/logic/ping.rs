//! Keep-alive handling.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::logic::PING;
use crate::runtime::connection::Connection;
use crate::runtime::engine::Engine;
use crate::runtime::wire::Message;

/// Slack on top of three missed intervals before a silent peer is evicted.
const HEARTBEAT_GRACE: Duration = Duration::from_secs(10);

/// Record the heartbeat and echo a header-only reply.
pub fn handle_ping(engine: &Engine, conn: &Arc<Connection>, msg: &Message) -> bool {
    if !msg.body().is_empty() {
        debug!(conn = conn.index(), len = msg.body().len(), "Ping with a body");
        return false;
    }

    conn.session().last_heartbeat = Instant::now();
    engine.send(Message::empty(msg.origin(), PING));
    true
}

/// Decide the fate of a connection whose heartbeat timer expired.
///
/// With `timeout_kick` the connection is closed outright. Otherwise it is
/// closed only once nothing has been heard from it for three intervals
/// plus [`HEARTBEAT_GRACE`].
pub fn heartbeat_timeout(engine: &Engine, conn: &Arc<Connection>, now: Instant) {
    if engine.config().timeout_kick {
        info!(conn = conn.index(), peer = ?conn.peer(), "Heartbeat timer expired, kicking");
        engine.close_connection(conn);
        return;
    }

    let limit = engine.timers().interval() * 3 + HEARTBEAT_GRACE;
    let silent = now.saturating_duration_since(conn.session().last_heartbeat);
    if silent > limit {
        info!(
            conn = conn.index(),
            peer = ?conn.peer(),
            silent_secs = silent.as_secs(),
            "No heartbeat, closing connection"
        );
        engine.close_connection(conn);
    }
}
