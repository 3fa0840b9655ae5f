//! TCP stream transport and acceptor.
//!
//! Sockets are created through socket2 so outbound connections can bind a
//! requested local address before connecting and listeners get an explicit
//! backlog depth. Read and accept deadlines use `SO_RCVTIMEO`, so a blocked
//! call wakes with `WouldBlock`/`TimedOut` when the deadline expires.

use super::{Acceptor, AcceptorFactory, StreamFactory, StreamTransport};
use crate::error::Error;

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

/// Stream transport over a connected `TcpStream`.
pub(crate) struct TcpStreamTransport {
    stream: TcpStream,
}

impl TcpStreamTransport {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl StreamTransport for TcpStreamTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn try_clone_reader(&self) -> io::Result<Option<Box<dyn StreamTransport>>> {
        // The clone shares the file descriptor, so the read deadline and a
        // shutdown on either handle apply to both.
        let clone = self.stream.try_clone()?;
        Ok(Some(Box::new(TcpStreamTransport::new(clone))))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

// Opens a connected, blocking TcpStream, optionally bound to a local address.
// Shared with the TLS factory, which wraps the raw stream in a session.
pub(crate) fn open_tcp_stream(
    local: Option<SocketAddr>,
    remote: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, Error> {
    let domain = Domain::for_address(remote);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    socket.connect_timeout(&remote.into(), connect_timeout)?;
    // connect_timeout leaves the socket non-blocking; restore blocking mode
    // before handing it to a deadline-driven read loop.
    socket.set_nonblocking(false)?;
    socket.set_nodelay(true)?;

    let stream: TcpStream = socket.into();
    let local_addr = stream.local_addr()?;
    info!(%local_addr, peer_addr = %remote, "Opened TCP connection");
    Ok(stream)
}

/// Opens plain TCP stream transports.
pub(crate) struct TcpStreamFactory;

impl StreamFactory for TcpStreamFactory {
    fn open(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Box<dyn StreamTransport>, Error> {
        let stream = open_tcp_stream(local, remote, connect_timeout)?;
        Ok(Box::new(TcpStreamTransport::new(stream)))
    }
}

/// Listening TCP socket with an accept deadline.
pub(crate) struct TcpAcceptor {
    socket: Socket,
}

impl TcpAcceptor {
    pub(crate) fn bind(local: SocketAddr, backlog: i32) -> Result<Self, Error> {
        let domain = Domain::for_address(local);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.listen(backlog)?;
        let bound = socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::InvalidAddress)?;
        info!(local_addr = %bound, backlog, "Listening for connections");
        Ok(Self { socket })
    }

    // The configured accept deadline, reused by the TLS acceptor to bound
    // the server-side handshake.
    pub(crate) fn accept_timeout(&self) -> io::Result<Option<Duration>> {
        self.socket.read_timeout()
    }

    // Accepts one raw TCP stream; used directly here and by the TLS acceptor.
    pub(crate) fn accept_stream(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (socket, addr) = self.socket.accept()?;
        let peer_addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
        socket.set_nodelay(true)?;
        let stream: TcpStream = socket.into();
        debug!(%peer_addr, "Accepted TCP connection");
        Ok((stream, peer_addr))
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&self) -> io::Result<(Box<dyn StreamTransport>, SocketAddr)> {
        let (stream, peer_addr) = self.accept_stream()?;
        Ok((Box::new(TcpStreamTransport::new(stream)), peer_addr))
    }

    fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        // SO_RCVTIMEO bounds a blocking accept the same way it bounds a read.
        self.socket.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP local address"))
    }
}

/// Binds plain TCP acceptors.
pub(crate) struct TcpAcceptorFactory;

impl AcceptorFactory for TcpAcceptorFactory {
    fn bind(&self, local: SocketAddr, backlog: i32) -> Result<Box<dyn Acceptor>, Error> {
        Ok(Box::new(TcpAcceptor::bind(local, backlog)?))
    }
}
