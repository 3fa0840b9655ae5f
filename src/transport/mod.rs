//! Transport capability traits and config-driven factory selection.
//!
//! Connections own their transport behind small capability traits: a stream
//! handle, an acceptor, and a datagram socket. The concrete kind (TCP or
//! TLS) is selected from the `transport_type` configuration key. The engine
//! in [`crate::connection`] never sees anything but these traits.

mod tcp;
#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "tls")]
mod tls_config;
mod udp;

pub(crate) use tcp::{TcpAcceptorFactory, TcpStreamFactory};
#[cfg(feature = "tls")]
pub(crate) use tls::{TlsAcceptorFactory, TlsStreamFactory};
pub(crate) use udp::UdpDatagramFactory;

use crate::config::get_namespaced_string;
use crate::error::Error;
use ::config::Config;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// A duplex byte-stream transport handle (TCP-like).
///
/// A read that exceeds the installed read deadline returns an I/O error of
/// kind `WouldBlock` or `TimedOut`; workers treat that as "no data yet",
/// never as a hard failure.
pub trait StreamTransport: Send {
    /// Reads up to `buf.len()` bytes. `Ok(0)` is end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flushes buffered writes (a no-op for raw sockets).
    fn flush(&mut self) -> io::Result<()>;

    /// Installs the deadline applied to every subsequent read.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Returns an independent read handle over the same underlying socket,
    /// if the transport supports one. Lets the worker read without holding
    /// the shared transport for the whole deadline window.
    fn try_clone_reader(&self) -> io::Result<Option<Box<dyn StreamTransport>>> {
        Ok(None)
    }

    /// Best-effort close of both directions. Errors are the caller's to log.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Opens stream transports bound to requested endpoints.
///
/// Used both for initial connects and for the address-migration protocol,
/// which reopens transports at new or rolled-back endpoints.
pub trait StreamFactory: Send + Sync {
    /// Opens a transport to `remote`, optionally bound to a local address.
    fn open(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Box<dyn StreamTransport>, Error>;

    /// Whether opened transports complete a handshake before becoming
    /// usable. Secure connections fire the handshake-completed event after
    /// every successful open.
    fn secure(&self) -> bool {
        false
    }
}

/// A listening transport handle producing accepted stream transports.
pub trait Acceptor: Send {
    /// Waits for one incoming connection, bounded by the accept deadline.
    /// Deadline expiry surfaces as `WouldBlock`/`TimedOut`.
    fn accept(&self) -> io::Result<(Box<dyn StreamTransport>, SocketAddr)>;

    /// Installs the deadline applied to every subsequent accept.
    fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Binds listening transports; used at construction and for server rebind.
pub trait AcceptorFactory: Send + Sync {
    fn bind(&self, local: SocketAddr, backlog: i32) -> Result<Box<dyn Acceptor>, Error>;

    /// Whether accepted transports completed a handshake during accept.
    fn secure(&self) -> bool {
        false
    }
}

/// A connectionless packet transport handle (UDP-like). One socket serves
/// both directions, so methods take `&self` and the handle is shared.
pub trait DatagramTransport: Send + Sync {
    /// Receives one packet, bounded by the read deadline. Returns the packet
    /// length and its source address. A zero-length packet is valid data,
    /// not end-of-stream.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Sends a packet to an explicit destination.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Sends a packet to the bound default peer.
    fn send(&self, buf: &[u8]) -> Result<usize, Error>;

    /// Installs the deadline applied to every subsequent receive.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The bound default peer, if any.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Binds datagram transports; used at construction and for rebind.
pub trait DatagramFactory: Send + Sync {
    fn bind(
        &self,
        local: SocketAddr,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<dyn DatagramTransport>, Error>;
}

// ============================================================================
// Config-driven factory selection
// ============================================================================

fn transport_type(config: &Config, name: &str) -> String {
    get_namespaced_string(config, name, "transport_type").unwrap_or_else(|_| "tcp".to_string())
}

fn invalid_transport_type(got: String) -> Error {
    let mut valid = vec!["tcp".to_string()];
    #[cfg(feature = "tls")]
    {
        valid.push("tls".to_string());
    }
    Error::InvalidTransportType { got, valid }
}

/// Selects the stream factory for outbound connections based on the
/// `transport_type` configuration key ("tcp" or "tls", defaulting to "tcp").
pub fn stream_factory_from_config(
    config: &Config,
    name: &str,
) -> Result<Arc<dyn StreamFactory>, Error> {
    match transport_type(config, name).as_str() {
        "tcp" => Ok(Arc::new(TcpStreamFactory)),
        #[cfg(feature = "tls")]
        "tls" => Ok(Arc::new(TlsStreamFactory::from_config(config, name)?)),
        other => Err(invalid_transport_type(other.to_string())),
    }
}

/// Selects the acceptor factory for listening endpoints based on the
/// `transport_type` configuration key.
pub fn acceptor_factory_from_config(
    config: &Config,
    name: &str,
) -> Result<Arc<dyn AcceptorFactory>, Error> {
    match transport_type(config, name).as_str() {
        "tcp" => Ok(Arc::new(TcpAcceptorFactory)),
        #[cfg(feature = "tls")]
        "tls" => Ok(Arc::new(TlsAcceptorFactory::from_config(config, name)?)),
        other => Err(invalid_transport_type(other.to_string())),
    }
}

/// The datagram factory. Datagram endpoints are always plain UDP; the
/// `transport_type` key does not apply to them.
pub fn datagram_factory_from_config(
    _config: &Config,
    _name: &str,
) -> Result<Arc<dyn DatagramFactory>, Error> {
    Ok(Arc::new(UdpDatagramFactory))
}
