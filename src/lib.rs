//! CommLink - a connection-oriented transport framework for Rust
//!
//! CommLink runs each network endpoint (TCP, TLS, or UDP) on its own worker
//! thread performing blocking, deadline-bounded I/O. Incoming payloads are
//! dispatched to listeners by byte-pattern matching, connections can migrate
//! to new socket addresses at runtime with automatic rollback, and listening
//! servers wrap every accepted connection in a managed child.
//!
//! Transport selection and tunables come from a [`config::Config`], with
//! per-instance namespacing (`{name}.{key}` over `{key}`).

pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod listener;
pub(crate) mod transport;

// These are the intended public API
pub use config::Tunables;
pub use connection::{
    ConnectionContext, DatagramConnection, SeedRegistration, ServerConnection, ServerContext,
    StreamConnection,
};
pub use error::Error;
pub use listener::{
    ConnectionListener, DataEvent, HandshakeEvent, IncomingEvent, ListenerRegistry, MatchMode,
    ServerListener, TerminatedEvent,
};
pub use transport::{
    acceptor_factory_from_config, datagram_factory_from_config, stream_factory_from_config,
    Acceptor, AcceptorFactory, DatagramFactory, DatagramTransport, StreamFactory, StreamTransport,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::Tunables;
    pub use crate::connection::{
        ConnectionContext, DatagramConnection, ServerConnection, ServerContext, StreamConnection,
    };
    pub use crate::error::Error;
    pub use crate::listener::{
        ConnectionListener, DataEvent, HandshakeEvent, IncomingEvent, MatchMode, ServerListener,
        TerminatedEvent,
    };
}
