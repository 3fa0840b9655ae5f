//! TLS stream transport and acceptor over rustls.
//!
//! The secure variant composes over the TCP layer: factories open or accept
//! a raw TCP stream, complete the rustls handshake eagerly, and return a
//! transport that behaves like any other stream behind the same trait. The
//! read deadline applies to the underlying socket, so a blocked TLS read
//! wakes with `WouldBlock` exactly like a plain TCP read.
//!
//! # Configuration Keys
//!
//! - `tls_server_cert` / `tls_server_key`: PEM paths, required for bind()
//! - `tls_ca_cert`: PEM path of the trust root, required for connect()
//! - `tls_server_name`: SNI override for connect() (defaults to "localhost")

use super::tcp::{open_tcp_stream, TcpAcceptor};
use super::tls_config::{load_tls_client_config, load_tls_server_config};
use super::{Acceptor, AcceptorFactory, StreamFactory, StreamTransport};
use crate::config::get_namespaced_string;
use crate::error::Error;

use ::config::Config;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// Client and server sessions have distinct rustls types; the transport
// dispatches over this enum so both sides share one implementation.
enum TlsStream {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

impl TlsStream {
    fn sock(&self) -> &TcpStream {
        match self {
            TlsStream::Client(s) => &s.sock,
            TlsStream::Server(s) => &s.sock,
        }
    }
}

/// Stream transport over an established TLS session.
pub(crate) struct TlsStreamTransport {
    stream: TlsStream,
}

impl StreamTransport for TlsStreamTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            TlsStream::Client(s) => s.read(buf),
            TlsStream::Server(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            TlsStream::Client(s) => s.write_all(buf),
            TlsStream::Server(s) => s.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            TlsStream::Client(s) => s.flush(),
            TlsStream::Server(s) => s.flush(),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock().set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.sock().local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.sock().peer_addr()
    }

    // No independent reader: the rustls session state is not splittable, so
    // the worker reads under the shared transport lock.

    fn shutdown(&mut self) -> io::Result<()> {
        match &mut self.stream {
            TlsStream::Client(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
            }
            TlsStream::Server(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
            }
        }
        self.stream.sock().shutdown(Shutdown::Both)
    }
}

/// Opens TLS client transports, completing the handshake before returning.
pub(crate) struct TlsStreamFactory {
    client_config: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<String>,
}

impl TlsStreamFactory {
    pub(crate) fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let client_config =
            if let Ok(ca_cert_path) = get_namespaced_string(config, name, "tls_ca_cert") {
                Some(Arc::new(load_tls_client_config(&ca_cert_path)?))
            } else {
                None
            };

        let server_name = match get_namespaced_string(config, name, "tls_server_name") {
            Ok(name) => Some(name),
            Err(config::ConfigError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            client_config,
            server_name,
        })
    }
}

impl StreamFactory for TlsStreamFactory {
    fn open(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Box<dyn StreamTransport>, Error> {
        let client_config = self
            .client_config
            .clone()
            .ok_or(Error::TlsClientConfigMissing)?;

        let mut tcp = open_tcp_stream(local, remote, connect_timeout)?;
        // Bound the handshake like the connect; the read deadline is
        // reinstalled by the connection once the transport is handed over.
        tcp.set_read_timeout(Some(connect_timeout))?;

        let server_name_value = self
            .server_name
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let server_name_for_err = server_name_value.clone();
        let server_name = ServerName::try_from(server_name_value)
            .map_err(|_| Error::TlsInvalidServerName(server_name_for_err))?;
        let mut conn = ClientConnection::new(client_config, server_name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;

        // Drive the handshake to completion on the blocking socket so the
        // transport is usable (and the handshake event truthful) on return.
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|e| Error::TlsHandshake(e.to_string()))?;
        }
        debug!(peer_addr = %remote, "TLS client handshake complete");

        Ok(Box::new(TlsStreamTransport {
            stream: TlsStream::Client(StreamOwned::new(conn, tcp)),
        }))
    }

    fn secure(&self) -> bool {
        true
    }
}

/// Listening TLS endpoint: accepts raw TCP and completes the server-side
/// handshake before handing the transport to the server's accept loop.
pub(crate) struct TlsAcceptor {
    tcp: TcpAcceptor,
    server_config: Arc<rustls::ServerConfig>,
}

impl Acceptor for TlsAcceptor {
    fn accept(&self) -> io::Result<(Box<dyn StreamTransport>, SocketAddr)> {
        let (mut stream, peer_addr) = self.tcp.accept_stream()?;
        // A silent or stalled client must not pin the accept loop; bound the
        // handshake with the same deadline as the accept itself.
        stream.set_read_timeout(self.tcp.accept_timeout()?)?;

        let mut conn = ServerConnection::new(self.server_config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // A failed client handshake aborts this connection, not the accept
        // loop; surface it as ConnectionAborted so the server treats it as
        // transient.
        while conn.is_handshaking() {
            conn.complete_io(&mut stream).map_err(|e| {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            })?;
        }
        info!(%peer_addr, "TLS server handshake complete");

        Ok((
            Box::new(TlsStreamTransport {
                stream: TlsStream::Server(StreamOwned::new(conn, stream)),
            }),
            peer_addr,
        ))
    }

    fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp.set_accept_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Binds TLS acceptors. Requires `tls_server_cert` and `tls_server_key`.
pub(crate) struct TlsAcceptorFactory {
    server_config: Option<Arc<rustls::ServerConfig>>,
}

impl TlsAcceptorFactory {
    pub(crate) fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let server_config = if let (Ok(cert_path), Ok(key_path)) = (
            get_namespaced_string(config, name, "tls_server_cert"),
            get_namespaced_string(config, name, "tls_server_key"),
        ) {
            Some(Arc::new(load_tls_server_config(&cert_path, &key_path)?))
        } else {
            None
        };

        Ok(Self { server_config })
    }
}

impl AcceptorFactory for TlsAcceptorFactory {
    fn bind(&self, local: SocketAddr, backlog: i32) -> Result<Box<dyn Acceptor>, Error> {
        let server_config = self
            .server_config
            .clone()
            .ok_or(Error::TlsServerConfigMissing)?;
        let tcp = TcpAcceptor::bind(local, backlog)?;
        Ok(Box::new(TlsAcceptor { tcp, server_config }))
    }

    fn secure(&self) -> bool {
        true
    }
}
