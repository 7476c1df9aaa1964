//! Business logic: the message handlers and the heartbeat policy.
//!
//! Handlers run on worker threads. Anything tied to the peer is touched
//! only while holding the connection's session lock.

pub mod account;
pub mod ping;

use crate::runtime::dispatch::Dispatcher;

/// Keep-alive, header-only in both directions.
pub const PING: u16 = 0;
pub const REGISTER: u16 = 5;
pub const LOGIN: u16 = 6;

/// The dispatch table the server runs with.
pub fn dispatcher() -> Dispatcher {
    Dispatcher::new()
        .route(PING, ping::handle_ping)
        .route(REGISTER, account::handle_register)
        .route(LOGIN, account::handle_login)
        .on_heartbeat_timeout(ping::heartbeat_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(dispatcher().routes(), 3);
    }
}
