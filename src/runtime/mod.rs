//! Custom runtime for a length-prefixed packet server.
//!
//! Threads and what they own:
//! - event loop: the `Poll`, accepts, and every socket read
//! - workers: drain the inbound queue and run the dispatcher
//! - sender: drains the outbound queue
//! - recycle sweep: returns closed connections to the pool after a grace period
//! - heartbeat monitor: expires timers and applies the heartbeat policy
//!
//! All of them share one [`engine::Engine`]. Anything that refers to a
//! connection across threads carries a [`connection::ConnRef`] and is
//! dropped once the slot's epoch moves on.

pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod flood;
pub mod framer;
mod mio;
pub mod pool;
pub mod send_queue;
pub mod sync;
pub mod timer;
pub mod wire;
pub mod workers;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use dispatch::Dispatcher;
use engine::Engine;

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to create poller: {0}")]
    Poll(#[source] io::Error),
    #[error("Invalid listen address '{0}'")]
    Address(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Failed to register listener on port {port}: {source}")]
    Register { port: u16, source: io::Error },
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: io::Error,
    },
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] ctrlc::Error),
}

/// A running server.
pub struct Server {
    engine: Arc<Engine>,
    threads: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl Server {
    pub(crate) fn new(
        engine: Arc<Engine>,
        threads: Vec<JoinHandle<()>>,
        local_addrs: Vec<SocketAddr>,
    ) -> Self {
        Self {
            engine,
            threads,
            local_addrs,
        }
    }

    /// Addresses actually bound, in configured port order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.engine))
    }

    /// Block until every thread has stopped, then release what is left.
    pub fn wait(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("A server thread panicked");
            }
        }
        self.engine.finish();
    }

    /// Stop the server and wait for it.
    pub fn shutdown(self) {
        self.engine.begin_shutdown();
        self.wait();
    }
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Engine>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.begin_shutdown();
    }
}

/// Start the server and return once it is running.
pub fn start(config: Config, dispatcher: Dispatcher) -> Result<Server, ServerError> {
    self::mio::start(config, dispatcher)
}

/// Run the server until SIGINT or SIGTERM.
pub fn run(config: Config, dispatcher: Dispatcher) -> Result<(), ServerError> {
    let server = start(config, dispatcher)?;

    let handle = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || handle.shutdown()) {
        server.shutdown();
        return Err(ServerError::Signal(e));
    }

    info!(addrs = ?server.local_addrs(), "Ready, stop with Ctrl-C or SIGTERM");
    server.wait();
    Ok(())
}
