//! Listener traits, dispatch events, and the pattern-based registry.
//!
//! Incoming payloads are routed to listeners by content pattern: each
//! registration pairs a byte pattern with a [`MatchMode`], and the first
//! registration (in registration order) whose pattern matches the payload
//! receives the event. Payloads that match no pattern go to the default
//! listener.

mod registry;

pub use registry::ListenerRegistry;

use crate::connection::StreamConnection;
use crate::error::Error;
use std::net::SocketAddr;

/// How a registered pattern is tested against an incoming payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Pattern occurs anywhere in the payload.
    Contains,
    /// Payload begins with the pattern.
    StartsWith,
    /// Payload ends with the pattern.
    EndsWith,
    /// Never matched by content. Used for broadcast-only registrations keyed
    /// by an opaque identifier (e.g., a server watching child termination).
    None,
}

/// A received payload, classified by size and ready for dispatch.
#[derive(Debug)]
pub struct DataEvent<'a> {
    /// Identity of the connection that read the payload.
    pub connection_id: u64,
    /// The received bytes.
    pub payload: &'a [u8],
    /// Source address of the packet. Set for datagram connections; `None`
    /// for stream connections, whose peer is fixed.
    pub source: Option<SocketAddr>,
}

/// Terminal event of a connection or server worker.
#[derive(Debug)]
pub struct TerminatedEvent {
    /// Identity of the connection whose worker exited.
    pub connection_id: u64,
    /// The error that ended the worker, or `None` for a requested stop or
    /// clean end-of-stream.
    pub error: Option<Error>,
}

/// Fired once a secure transport has completed its handshake.
#[derive(Debug)]
pub struct HandshakeEvent {
    /// Identity of the connection that completed the handshake.
    pub connection_id: u64,
    /// Remote endpoint of the secured connection, when known.
    pub peer_addr: Option<SocketAddr>,
}

/// A newly accepted child connection, fanned out to server listeners.
pub struct IncomingEvent<'a> {
    /// Identity of the accepting server.
    pub server_id: u64,
    /// The child connection. Listeners typically register their own pattern
    /// listeners here before the child starts reading.
    pub connection: &'a StreamConnection,
    /// Remote endpoint of the accepted connection.
    pub peer_addr: SocketAddr,
}

/// Callbacks for stream and datagram connections.
///
/// All methods default to no-ops so implementors only handle the events they
/// care about. Callbacks run on the connection's worker thread: dispatch for
/// successive reads of one connection is strictly in read order, and a slow
/// callback stalls that connection's read loop (and only that one).
///
/// A callback may call `stop()` on its own connection; the stop skips the
/// self-join and the connection winds down after the callback returns.
pub trait ConnectionListener: Send + Sync {
    /// Payload within the configured `[min_packet_len, max_packet_len]` range.
    fn on_data(&self, event: &DataEvent<'_>) {
        let _ = event;
    }

    /// Payload shorter than `min_packet_len`. The connection keeps running.
    fn on_undersized(&self, event: &DataEvent<'_>) {
        let _ = event;
    }

    /// Payload longer than `max_packet_len`. The connection keeps running.
    fn on_oversized(&self, event: &DataEvent<'_>) {
        let _ = event;
    }

    /// The connection's worker exited. Broadcast to every registered listener
    /// and the default listener, regardless of patterns.
    fn on_terminated(&self, event: &TerminatedEvent) {
        let _ = event;
    }

    /// A secure transport finished its handshake. Delivered to the default
    /// listener only.
    fn on_handshake_complete(&self, event: &HandshakeEvent) {
        let _ = event;
    }
}

/// Callbacks for listening (server) connections.
pub trait ServerListener: Send + Sync {
    /// A child connection was accepted and added to the live set. The child
    /// has not started reading yet.
    fn on_incoming(&self, event: &IncomingEvent<'_>) {
        let _ = event;
    }

    /// The server's accept loop exited. All children are stopped before this
    /// fires.
    fn on_server_terminated(&self, event: &TerminatedEvent) {
        let _ = event;
    }
}
