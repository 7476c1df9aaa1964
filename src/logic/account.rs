//! Register and login requests.
//!
//! Both carry fixed-size, NUL-padded string fields:
//!
//! ```text
//! REGISTER: kind: i32 | username: [u8; 56] | password: [u8; 40]
//! LOGIN:                username: [u8; 56] | password: [u8; 40]
//! ```
//!
//! The reply uses the request's layout with the password blanked.

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, info};

use crate::logic::{LOGIN, REGISTER};
use crate::runtime::connection::Connection;
use crate::runtime::engine::Engine;
use crate::runtime::wire::Message;

pub const USERNAME_LEN: usize = 56;
pub const PASSWORD_LEN: usize = 40;
pub const LOGIN_BODY_LEN: usize = USERNAME_LEN + PASSWORD_LEN;
pub const REGISTER_BODY_LEN: usize = 4 + LOGIN_BODY_LEN;

/// A decoded username/password pair.
#[derive(Debug, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub username: &'a [u8],
    pub password: &'a [u8],
}

impl<'a> Credentials<'a> {
    /// Decode the two fixed-size fields at the start of `raw`.
    fn decode(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < LOGIN_BODY_LEN {
            return None;
        }
        let username = until_nul(&raw[..USERNAME_LEN]);
        let password = until_nul(&raw[USERNAME_LEN..LOGIN_BODY_LEN]);
        if username.is_empty() {
            return None;
        }
        Some(Self { username, password })
    }

    /// Encode the username and a blank password field.
    fn encode_reply(&self, out: &mut BytesMut) {
        out.put_slice(self.username);
        out.put_bytes(0, USERNAME_LEN - self.username.len());
        out.put_bytes(0, PASSWORD_LEN);
    }
}

fn until_nul(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

pub fn handle_register(engine: &Engine, conn: &Arc<Connection>, msg: &Message) -> bool {
    let body = msg.body();
    if body.len() != REGISTER_BODY_LEN {
        debug!(conn = conn.index(), len = body.len(), "Malformed register request");
        return false;
    }

    let mut fields = body;
    let kind = fields.get_i32();
    let Some(credentials) = Credentials::decode(fields) else {
        debug!(conn = conn.index(), "Register request without a username");
        return false;
    };

    let mut reply = BytesMut::with_capacity(REGISTER_BODY_LEN);
    {
        let _session = conn.session();
        info!(
            conn = conn.index(),
            kind,
            user = %String::from_utf8_lossy(credentials.username),
            "Register"
        );
        reply.put_i32(kind);
        credentials.encode_reply(&mut reply);
    }

    engine.send(Message::new(msg.origin(), REGISTER, &reply));
    true
}

pub fn handle_login(engine: &Engine, conn: &Arc<Connection>, msg: &Message) -> bool {
    let body = msg.body();
    if body.len() != LOGIN_BODY_LEN {
        debug!(conn = conn.index(), len = body.len(), "Malformed login request");
        return false;
    }

    let Some(credentials) = Credentials::decode(body) else {
        debug!(conn = conn.index(), "Login request without a username");
        return false;
    };

    let mut reply = BytesMut::with_capacity(LOGIN_BODY_LEN);
    {
        let _session = conn.session();
        info!(
            conn = conn.index(),
            user = %String::from_utf8_lossy(credentials.username),
            "Login"
        );
        credentials.encode_reply(&mut reply);
    }

    engine.send(Message::new(msg.origin(), LOGIN, &reply));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logic::dispatcher;
    use crate::runtime::connection::ConnRef;
    use crate::runtime::dispatch::Dispatched;
    use crate::runtime::engine::tests::{engine, socket_pair};

    fn login_body(user: &[u8], pass: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; LOGIN_BODY_LEN];
        body[..user.len()].copy_from_slice(user);
        body[USERNAME_LEN..USERNAME_LEN + pass.len()].copy_from_slice(pass);
        body
    }

    fn open(engine: &Engine) -> (ConnRef, std::net::TcpStream) {
        let (stream, peer, client) = socket_pair();
        (engine.open_connection(stream, peer).unwrap(), client)
    }

    #[test]
    fn test_decode_credentials() {
        let body = login_body(b"alice", b"secret");
        let creds = Credentials::decode(&body).unwrap();
        assert_eq!(creds.username, b"alice");
        assert_eq!(creds.password, b"secret");

        assert!(Credentials::decode(&login_body(b"", b"secret")).is_none());
        assert!(Credentials::decode(&body[..10]).is_none());
    }

    #[test]
    fn test_full_width_username() {
        let user = [b'u'; USERNAME_LEN];
        let body = login_body(&user, b"");
        assert_eq!(Credentials::decode(&body).unwrap().username, &user[..]);
    }

    #[test]
    fn test_register_reply() {
        let (_poll, engine) = engine(Config::default(), dispatcher());
        let (r, _client) = open(&engine);

        let mut body = 7i32.to_be_bytes().to_vec();
        body.extend(login_body(b"bob", b"hunter2"));
        let msg = Message::new(r, REGISTER, &body);
        assert_eq!(engine.dispatch(msg), Dispatched::Handled(true));

        let mut replies = Vec::new();
        engine.send_queue().drain(|m| {
            replies.push(m);
            None
        });
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.code(), REGISTER);
        assert_eq!(reply.body().len(), REGISTER_BODY_LEN);
        assert!(reply.checksum_ok());
        assert_eq!(&reply.body()[..4], &7i32.to_be_bytes());
        assert_eq!(&reply.body()[4..7], b"bob");
        assert!(reply.body()[4 + USERNAME_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_sizes_are_rejected() {
        let (_poll, engine) = engine(Config::default(), dispatcher());
        let (r, _client) = open(&engine);

        let short = Message::new(r, LOGIN, &[1u8; LOGIN_BODY_LEN - 1]);
        assert_eq!(engine.dispatch(short), Dispatched::Handled(false));

        let login_sized = Message::new(r, REGISTER, &login_body(b"bob", b"pw"));
        assert_eq!(engine.dispatch(login_sized), Dispatched::Handled(false));

        assert!(engine.send_queue().is_empty());
    }

    #[test]
    fn test_dispatch_filters() {
        let (_poll, engine) = engine(Config::default(), dispatcher());
        let (r, _client) = open(&engine);

        // corrupt checksum
        let good = Message::new(r, LOGIN, &login_body(b"carol", b"pw"));
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&good.as_bytes()[..8]);
        raw[7] ^= 0xff;
        let mut bad = Message::with_header(r, &raw);
        bad.body_mut().copy_from_slice(good.body());
        assert_eq!(engine.dispatch(bad), Dispatched::BadChecksum);

        // unknown code
        assert_eq!(engine.dispatch(Message::empty(r, 99)), Dispatched::Unrouted);

        // stale origin
        let conn = engine.pool().resolve(r).unwrap();
        engine.close_connection(&conn);
        assert_eq!(engine.dispatch(good), Dispatched::Stale);
        assert!(engine.send_queue().is_empty());
    }
}
