//! Listening sockets.
//!
//! Accepted sockets come back non-blocking and close-on-exec in a single
//! `accept4` call where the platform has it. If the kernel reports
//! `ENOSYS` the listener switches to plain `accept` for good and sets the
//! flags itself.

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tracing::warn;

use crate::runtime::ServerError;

/// Pending connections the kernel queues per listening socket.
const LISTEN_BACKLOG: i32 = 511;

pub struct Listener {
    port: u16,
    inner: TcpListener,
    use_accept4: bool,
}

impl Listener {
    /// Bind a non-blocking listener on `host:port`.
    pub fn bind(host: &str, port: u16) -> Result<Self, ServerError> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ServerError::Address(format!("{host}:{port}")))?;
        let addr = SocketAddr::new(ip, port);
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        if let Err(e) = socket.set_reuse_port(true) {
            warn!(port, error = %e, "SO_REUSEPORT unavailable");
        }
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        Ok(Self {
            port,
            inner: TcpListener::from_std(socket.into()),
            use_accept4: cfg!(any(target_os = "linux", target_os = "android")),
        })
    }

    /// The configured port, which is 0 for an ephemeral bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// The socket as a registrable event source.
    pub fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }

    /// Accept one pending connection.
    pub fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (fd, addr) = match self.accept_raw(self.use_accept4) {
            Err(e) if self.use_accept4 && e.raw_os_error() == Some(libc::ENOSYS) => {
                warn!(port = self.port, "accept4 unavailable, falling back to accept");
                self.use_accept4 = false;
                self.accept_raw(false)?
            }
            other => other?,
        };

        // SAFETY: `fd` was just returned by accept and nothing else owns it.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        if !self.use_accept4 {
            socket.set_nonblocking(true)?;
            socket.set_cloexec(true)?;
        }

        let peer = addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family")
        })?;
        let stream: std::net::TcpStream = socket.into();
        Ok((TcpStream::from_std(stream), peer))
    }

    fn accept_raw(&self, use_accept4: bool) -> io::Result<(RawFd, SockAddr)> {
        let listen_fd = self.inner.as_raw_fd();

        // SAFETY: try_init passes a zeroed sockaddr_storage and its length,
        // both valid for the duration of the call.
        unsafe {
            SockAddr::try_init(|storage, len| {
                let fd = if use_accept4 {
                    accept4(listen_fd, storage.cast(), len)
                } else {
                    libc::accept(listen_fd, storage.cast(), len)
                };
                if fd < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(fd)
                }
            })
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn accept4(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: *mut libc::socklen_t,
) -> libc::c_int {
    libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn accept4(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: *mut libc::socklen_t,
) -> libc::c_int {
    libc::accept(fd, addr, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    fn accept_blocking(listener: &mut Listener) -> (TcpStream, SocketAddr) {
        for _ in 0..200 {
            match listener.accept() {
                Ok(accepted) => return accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        panic!("no connection arrived");
    }

    #[test]
    fn test_bind_and_accept() {
        let mut listener = Listener::bind("127.0.0.1", 0).unwrap();
        assert_eq!(listener.port(), 0);
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // nothing pending yet
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = accept_blocking(&mut listener);
        assert_eq!(peer, client.local_addr().unwrap());

        // accepted sockets are non-blocking
        let mut buf = [0u8; 4];
        assert_eq!(
            (&stream).read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        client.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!((&stream).read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_plain_accept_path() {
        let mut listener = Listener::bind("127.0.0.1", 0).unwrap();
        listener.use_accept4 = false;
        let addr = listener.local_addr().unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, _) = accept_blocking(&mut listener);

        let mut buf = [0u8; 1];
        assert_eq!(
            (&stream).read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_bad_host_is_rejected() {
        assert!(matches!(
            Listener::bind("not an address", 0),
            Err(ServerError::Address(_))
        ));
    }
}
