//! Listening sockets and accepted connection streams.
use std::fs;
use std::io;
use std::io::prelude::*;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use log::*;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::address::{BindAddress, Family};
use crate::environ::PeerAddr;
use crate::server::ServerError;
use crate::tls::{self, TlsContext, TlsError, TlsStream};

/// Backlog of pending connections.
pub const LISTEN_QUEUE: i32 = 128;

enum ListenSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound, listening socket, optionally terminating TLS on the connections
/// it accepts.
pub struct Listener {
    socket: ListenSocket,
    tls: Option<TlsContext>,
}

impl Listener {
    /// Bind and listen on `address`.
    ///
    /// A stale file at a Unix socket path is removed first. TLS is only
    /// available on TCP sockets.
    pub fn bind(address: &BindAddress, tls: Option<TlsContext>) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            address: address.to_string(),
            source,
        };
        let socket = match address {
            BindAddress::Inet(addr) => {
                ListenSocket::Tcp(bind_inet(addr).map_err(bind_error)?)
            }
            #[cfg(unix)]
            BindAddress::Unix(path) => {
                if tls.is_some() {
                    return Err(ServerError::Config(
                        "TLS is not supported on unix sockets".to_string(),
                    ));
                }
                if path.exists() {
                    debug!("removing stale socket {}", path.display());
                    fs::remove_file(path).map_err(bind_error)?;
                }
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(bind_error)?;
                socket
                    .bind(&SockAddr::unix(path).map_err(bind_error)?)
                    .map_err(bind_error)?;
                socket.listen(LISTEN_QUEUE).map_err(bind_error)?;
                ListenSocket::Unix(socket.into())
            }
            #[cfg(not(unix))]
            BindAddress::Unix(_) => {
                return Err(ServerError::Config(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
            BindAddress::Unresolved(host, _) => {
                return Err(bind_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("could not resolve host {:?}", host),
                )))
            }
        };
        Ok(Self { socket, tls })
    }

    /// Adopt an already bound and listening descriptor, such as one handed
    /// over by a parent process.
    #[cfg(unix)]
    pub fn from_fd(fd: RawFd, family: Family, tls: Option<TlsContext>) -> Result<Self, ServerError> {
        // SAFETY: the descriptor is owned by this process and not used
        // elsewhere once adopted.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let socket = match family {
            Family::Unix if tls.is_some() => {
                return Err(ServerError::Config(
                    "TLS is not supported on unix sockets".to_string(),
                ))
            }
            Family::Unix => ListenSocket::Unix(socket.into()),
            Family::Ipv4 | Family::Ipv6 => ListenSocket::Tcp(socket.into()),
        };
        debug!("adopted listening socket from descriptor {}", fd);
        Ok(Self { socket, tls })
    }

    #[cfg(not(unix))]
    pub fn from_fd(_fd: i32, _family: Family, _tls: Option<TlsContext>) -> Result<Self, ServerError> {
        Err(ServerError::Config(
            "inherited sockets are not supported on this platform".to_string(),
        ))
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn local_addr(&self) -> io::Result<BindAddress> {
        match &self.socket {
            ListenSocket::Tcp(listener) => listener.local_addr().map(BindAddress::Inet),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().map(|p| p.to_path_buf()).unwrap_or_default();
                Ok(BindAddress::Unix(path))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.socket {
            ListenSocket::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    pub fn accept(&self) -> io::Result<Incoming> {
        let (socket, peer) = match &self.socket {
            ListenSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                (Accepted::Tcp(stream), PeerAddr::Inet(addr))
            }
            #[cfg(unix)]
            ListenSocket::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                (Accepted::Unix(stream), PeerAddr::Local)
            }
        };
        Ok(Incoming {
            socket,
            peer,
            tls: self.tls.clone(),
        })
    }

    /// Give up ownership of the descriptor, keeping it open.
    #[cfg(unix)]
    pub fn into_raw_fd(self) -> RawFd {
        match self.socket {
            ListenSocket::Tcp(listener) => listener.into_raw_fd(),
            ListenSocket::Unix(listener) => listener.into_raw_fd(),
        }
    }

    /// Let child processes started with `exec` inherit the descriptor.
    #[cfg(unix)]
    pub fn set_inheritable(&self) -> io::Result<()> {
        match &self.socket {
            ListenSocket::Tcp(listener) => socket2::SockRef::from(listener).set_cloexec(false),
            ListenSocket::Unix(listener) => socket2::SockRef::from(listener).set_cloexec(false),
        }
    }
}

fn bind_inet(addr: &SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(LISTEN_QUEUE)?;
    Ok(socket.into())
}

/// A plain accepted socket.
enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// An accepted connection whose TLS handshake, if any, has not happened
/// yet.
pub struct Incoming {
    socket: Accepted,
    pub peer: PeerAddr,
    tls: Option<TlsContext>,
}

impl Incoming {
    /// Make the socket blocking with the given read and write timeout.
    pub fn prepare(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.socket {
            Accepted::Tcp(stream) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Accepted::Unix(stream) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
        }
    }

    /// Perform the TLS handshake if the listener terminates TLS.
    pub fn establish(self) -> Result<Stream, TlsError> {
        match (self.socket, self.tls) {
            (Accepted::Tcp(stream), Some(tls)) => Ok(Stream::Tls(Box::new(tls.accept(stream)?))),
            (Accepted::Tcp(stream), None) => Ok(Stream::Tcp(stream)),
            #[cfg(unix)]
            (Accepted::Unix(stream), _) => Ok(Stream::Unix(stream)),
        }
    }
}

/// An established connection.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream>),
}

impl Stream {
    pub fn peer_certificate(&self) -> Option<String> {
        match self {
            Self::Tls(stream) => tls::peer_certificate_pem(&stream.conn),
            _ => None,
        }
    }

    /// Flush and shut down the write side, sending a TLS close notification
    /// first where applicable.
    pub fn close(&mut self) {
        let result = match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Write),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Write),
            Self::Tls(stream) => {
                stream.conn.send_close_notify();
                stream
                    .flush()
                    .and_then(|_| stream.sock.shutdown(Shutdown::Write))
            }
        };
        if let Err(err) = result {
            trace!("error closing connection: {}", err);
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bind_tcp_and_accept() {
        let listener = Listener::bind(&BindAddress::Inet("127.0.0.1:0".parse().unwrap()), None).unwrap();
        let addr = match listener.local_addr().unwrap() {
            BindAddress::Inet(addr) => addr,
            other => panic!("unexpected {}", other),
        };
        assert_ne!(addr.port(), 0);
        let _client = TcpStream::connect(addr).unwrap();
        let incoming = listener.accept().unwrap();
        assert!(matches!(incoming.peer, PeerAddr::Inet(_)));
        incoming.prepare(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(incoming.establish().unwrap(), Stream::Tcp(_)));
    }

    #[test]
    fn test_nonblocking_accept_would_block() {
        let listener = Listener::bind(&BindAddress::Inet("127.0.0.1:0".parse().unwrap()), None).unwrap();
        listener.set_nonblocking(true).unwrap();
        let err = listener.accept().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_unresolved_address_fails_to_bind() {
        let address = BindAddress::Unresolved("no-such-host.invalid".to_string(), 80);
        assert!(matches!(Listener::bind(&address, None), Err(ServerError::Bind { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");
        fs::write(&path, b"stale").unwrap();
        let listener = Listener::bind(&BindAddress::Unix(path.clone()), None).unwrap();
        assert_eq!(listener.local_addr().unwrap(), BindAddress::Unix(path.clone()));

        let _client = UnixStream::connect(&path).unwrap();
        let incoming = listener.accept().unwrap();
        assert_eq!(incoming.peer, PeerAddr::Local);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_rejects_tls() {
        let dir = tempfile::tempdir().unwrap();
        let tls = crate::tls::generate_adhoc_context().unwrap();
        let result = Listener::bind(&BindAddress::Unix(dir.path().join("tls.sock")), Some(tls));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_adopt_descriptor() {
        let listener = Listener::bind(&BindAddress::Inet("127.0.0.1:0".parse().unwrap()), None).unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();
        let adopted = Listener::from_fd(fd, Family::Ipv4, None).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);
    }
}
