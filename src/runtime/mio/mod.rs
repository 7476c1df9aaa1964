//! mio-based backend.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). Sets up
//! the listeners and the poller, then starts every thread the server runs:
//! the event loop, the workers, the sender, the recycle sweep and, when
//! heartbeats are enabled, the heartbeat monitor.

mod event_loop;
mod listener;

use mio::{Interest, Poll, Waker};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

use crate::config::Config;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::engine::{spawn_service_threads, Engine};
use crate::runtime::workers::WorkerPool;
use crate::runtime::{Server, ServerError};

use event_loop::{listener_token, WAKE_TOKEN};
use listener::Listener;

/// Bind every configured port and start the server threads.
pub fn start(config: Config, dispatcher: Dispatcher) -> Result<Server, ServerError> {
    let poll = Poll::new().map_err(ServerError::Poll)?;

    let mut listeners = Vec::with_capacity(config.listen_ports.len());
    let mut local_addrs = Vec::with_capacity(config.listen_ports.len());
    for (position, &port) in config.listen_ports.iter().enumerate() {
        let mut listener = Listener::bind(&config.host, port)?;
        poll.registry()
            .register(listener.source(), listener_token(position), Interest::READABLE)
            .map_err(|source| ServerError::Register { port, source })?;

        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Register { port, source })?;
        info!(addr = %addr, "Listening");
        local_addrs.push(addr);
        listeners.push(listener);
    }

    let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServerError::Poll)?;
    let registry = poll.registry().try_clone().map_err(ServerError::Poll)?;

    let worker_threads = config.worker_threads;
    let engine = Arc::new(Engine::new(config, dispatcher, registry, waker));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let spawned = spawn_all(&engine, worker_threads, poll, listeners, &mut handles);
    if let Err(e) = spawned {
        engine.begin_shutdown();
        for handle in handles {
            let _ = handle.join();
        }
        return Err(e);
    }

    info!(
        workers = worker_threads,
        ports = ?engine.config().listen_ports,
        "Server started"
    );
    Ok(Server::new(engine, handles, local_addrs))
}

fn spawn_all(
    engine: &Arc<Engine>,
    worker_threads: usize,
    poll: Poll,
    listeners: Vec<Listener>,
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<(), ServerError> {
    handles.extend(
        WorkerPool::spawn(engine, worker_threads)
            .map_err(spawn_err("worker"))?
            .into_handles(),
    );
    handles.extend(spawn_service_threads(engine).map_err(spawn_err("service"))?);

    let event_engine = Arc::clone(engine);
    handles.push(
        thread::Builder::new()
            .name("event-loop".to_string())
            .spawn(move || event_loop::run(event_engine, poll, listeners))
            .map_err(spawn_err("event-loop"))?,
    );

    Ok(())
}

fn spawn_err(name: &'static str) -> impl FnOnce(io::Error) -> ServerError {
    move |source| ServerError::Spawn { name, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic;
    use crate::runtime::wire::{checksum, HEADER_SIZE};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.listen_ports = vec![0];
        config.worker_threads = 2;
        config
    }

    fn connect(server: &Server) -> TcpStream {
        let stream = TcpStream::connect(server.local_addrs()[0]).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn packet(code: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((HEADER_SIZE + body.len()) as u16).to_be_bytes());
        out.extend_from_slice(&code.to_be_bytes());
        let sum = if body.is_empty() { 0 } else { checksum(body) };
        out.extend_from_slice(&sum.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_ping_round_trip() {
        let server = start(test_config(), logic::dispatcher()).unwrap();
        let mut client = connect(&server);

        client.write_all(&packet(logic::PING, b"")).unwrap();
        let mut reply = [0u8; HEADER_SIZE];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0, 8, 0, 0, 0, 0, 0, 0]);

        server.shutdown();
    }

    #[test]
    fn test_oversized_header_then_valid_packet() {
        let server = start(test_config(), logic::dispatcher()).unwrap();
        let mut client = connect(&server);

        let mut bogus = 65000u16.to_be_bytes().to_vec();
        bogus.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        client.write_all(&bogus).unwrap();
        client.write_all(&packet(logic::PING, b"")).unwrap();

        let mut reply = [0u8; HEADER_SIZE];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0, 8, 0, 0, 0, 0, 0, 0]);

        server.shutdown();
    }

    #[test]
    fn test_login_reply_has_valid_checksum() {
        let server = start(test_config(), logic::dispatcher()).unwrap();
        let mut client = connect(&server);

        let mut body = vec![0u8; logic::account::LOGIN_BODY_LEN];
        body[..5].copy_from_slice(b"alice");
        body[56..62].copy_from_slice(b"secret");
        client.write_all(&packet(logic::LOGIN, &body)).unwrap();

        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).unwrap();
        let total = u16::from_be_bytes([header[0], header[1]]) as usize;
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), logic::LOGIN);
        assert_eq!(total, HEADER_SIZE + logic::account::LOGIN_BODY_LEN);

        let mut reply = vec![0u8; total - HEADER_SIZE];
        client.read_exact(&mut reply).unwrap();
        let sum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        assert_eq!(sum, checksum(&reply));
        assert_eq!(&reply[..5], b"alice");

        server.shutdown();
    }

    #[test]
    fn test_disconnect_recycles_slot() {
        let server = start(test_config(), logic::dispatcher()).unwrap();
        let engine = Arc::clone(server.engine());

        let mut client = connect(&server);
        assert!(wait_until(|| engine.pool().online() == 1));

        client.write_all(&[0, 8, 0]).unwrap();
        drop(client);

        assert!(wait_until(|| engine.pool().online() == 0));
        assert_eq!(engine.pool().stats().pending_recycle, 1);
        assert!(engine.inbound().is_empty());

        server.shutdown();
        assert_eq!(engine.pool().stats().pending_recycle, 0);
    }

    #[test]
    fn test_shutdown_stops_all_threads() {
        let server = start(test_config(), logic::dispatcher()).unwrap();
        let handle = server.shutdown_handle();
        let waiter = thread::spawn(move || server.wait());

        handle.shutdown();
        waiter.join().unwrap();
    }
}
