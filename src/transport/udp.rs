//! UDP datagram transport.

use super::{DatagramFactory, DatagramTransport};
use crate::error::Error;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Datagram transport over a bound `UdpSocket`, optionally connected to a
/// default peer. `UdpSocket` I/O takes `&self`, so one handle serves both
/// directions without locking.
pub(crate) struct UdpDatagramTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpDatagramTransport {
    pub(crate) fn bind(local: SocketAddr, peer: Option<SocketAddr>) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local)?;
        if let Some(peer) = peer {
            socket.connect(peer)?;
        }
        let local_addr = socket.local_addr()?;
        info!(%local_addr, peer_addr = ?peer, "Bound UDP socket");
        Ok(Self { socket, peer })
    }
}

impl DatagramTransport for UdpDatagramTransport {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        if self.peer.is_none() {
            return Err(Error::NoDefaultPeer);
        }
        Ok(self.socket.send(buf)?)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Binds UDP datagram transports.
pub(crate) struct UdpDatagramFactory;

impl DatagramFactory for UdpDatagramFactory {
    fn bind(
        &self,
        local: SocketAddr,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<dyn DatagramTransport>, Error> {
        Ok(Arc::new(UdpDatagramTransport::bind(local, peer)?))
    }
}
