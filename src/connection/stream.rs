//! Duplex byte-stream connection: read loop, size-classified dispatch, send,
//! and the address-migration protocol.

use super::{
    broadcast_terminated, classify, dispatch_payload, read_deadline, ConnectionCore,
    ConnectionContext, Endpoints,
};
use crate::error::Error;
use crate::listener::{
    ConnectionListener, DataEvent, HandshakeEvent, ListenerRegistry, MatchMode, TerminatedEvent,
};
use crate::transport::{stream_factory_from_config, StreamFactory, StreamTransport};

use ::config::Config;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub(crate) struct StreamInner {
    core: ConnectionCore,
    registry: Mutex<ListenerRegistry<dyn ConnectionListener>>,
    transport: Mutex<Option<Box<dyn StreamTransport>>>,
    endpoints: Mutex<Endpoints>,
    factory: Arc<dyn StreamFactory>,
}

/// A duplex, byte-stream connection (TCP or TLS) with a dedicated worker
/// thread reading and dispatching incoming data.
///
/// Handles are cheap clones sharing one connection; dropping them does not
/// stop the worker. Call [`stop`](Self::stop) for that.
///
/// `start()`/`stop()`/`set_socket_address()` are safe to call from any
/// thread, but concurrent callers must serialize among themselves; the
/// connection does not arbitrate racing lifecycle requests.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl StreamConnection {
    /// Connects to `addr` using the transport selected by the
    /// `transport_type` configuration key ("tcp" or "tls").
    ///
    /// Honors `ctx.auto_start`; with it off, call [`start`](Self::start) to
    /// begin reading.
    pub fn connect<A: ToSocketAddrs>(
        config: &Config,
        ctx: ConnectionContext,
        addr: A,
    ) -> Result<Self, Error> {
        Self::connect_named(config, "", ctx, addr)
    }

    /// Like [`connect`](Self::connect) with configuration namespacing:
    /// `{name}.{key}` takes priority over `{key}`.
    pub fn connect_named<A: ToSocketAddrs>(
        config: &Config,
        name: &str,
        ctx: ConnectionContext,
        addr: A,
    ) -> Result<Self, Error> {
        let factory = stream_factory_from_config(config, name)?;
        let remote = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let transport = factory.open(None, remote, ctx.tunables.connect_timeout)?;
        let secure = factory.secure();
        Self::from_parts(factory, ctx, transport, false, secure)
    }

    // Assembles a connection around an already-open transport. Used by
    // connect(), and by the server for accepted children (with `secure` from
    // the acceptor).
    pub(crate) fn from_parts(
        factory: Arc<dyn StreamFactory>,
        ctx: ConnectionContext,
        mut transport: Box<dyn StreamTransport>,
        local_pinned: bool,
        secure: bool,
    ) -> Result<Self, Error> {
        transport.set_read_timeout(Some(read_deadline(&ctx.tunables.socket_timeout)))?;
        let endpoints = Endpoints {
            local: transport.local_addr().ok(),
            remote: transport.peer_addr().ok(),
            local_pinned,
        };

        let mut registry = ListenerRegistry::new(ctx.default_listener);
        for (pattern, listener, mode) in ctx.registrations {
            registry.register(&pattern, listener, mode);
        }

        let inner = Arc::new(StreamInner {
            core: ConnectionCore::new("stream", ctx.tunables),
            registry: Mutex::new(registry),
            transport: Mutex::new(Some(transport)),
            endpoints: Mutex::new(endpoints),
            factory,
        });
        let connection = Self { inner };

        if secure {
            connection.inner.fire_handshake_complete();
        }
        if ctx.auto_start {
            connection.start()?;
        }
        Ok(connection)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl StreamConnection {
    /// Unique identity of this connection, as carried by its events.
    pub fn id(&self) -> u64 {
        self.inner.core.id()
    }

    /// Whether a start has been requested and not yet stopped.
    pub fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    /// Whether the worker thread is currently executing its loop.
    pub fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    /// Spawns the worker thread. No-op if already started.
    pub fn start(&self) -> Result<(), Error> {
        if !self.inner.core.begin_start() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.inner.core.spawn_worker(move || StreamInner::run(inner))
    }

    /// Requests the worker to exit and closes the transport.
    ///
    /// Called from any thread but the worker, this blocks until the worker
    /// has drained (bounded by the socket timeout). Called from a listener
    /// callback on the worker thread itself, it skips the join and the
    /// worker winds down after the callback returns.
    #[instrument(skip(self), fields(name = %self.inner.core.name()))]
    pub fn stop(&self) {
        self.inner.core.request_stop();
        self.inner.core.join_worker();
        self.inner.close_transport();
    }
}

// ============================================================================
// Data operations
// ============================================================================

impl StreamConnection {
    /// Writes `data` to the peer.
    ///
    /// May wait up to the socket timeout when the worker holds the transport
    /// for a blocking read (TLS transports only; TCP reads use an
    /// independent handle).
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let mut guard = self.inner.transport.lock().expect("transport lock poisoned");
        let transport = guard.as_mut().ok_or(Error::NotConnected)?;
        transport.write_all(data)?;
        transport.flush()?;
        debug!(name = %self.inner.core.name(), len = data.len(), "Sent data");
        Ok(())
    }
}

// ============================================================================
// Listener management
// ============================================================================

impl StreamConnection {
    /// Registers a listener for payloads matching `pattern` under `mode`.
    ///
    /// No-op for an empty pattern or when the listener is the connection's
    /// own state (routing payloads to oneself would recurse). A
    /// byte-identical pattern overwrites the existing registration in place.
    pub fn add_listener(
        &self,
        pattern: &[u8],
        listener: Arc<dyn ConnectionListener>,
        mode: MatchMode,
    ) {
        if Arc::as_ptr(&listener) as *const () == Arc::as_ptr(&self.inner) as *const () {
            return;
        }
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .register(pattern, listener, mode);
    }

    /// Removes the registration for `pattern`. No-op if absent.
    pub fn remove_listener(&self, pattern: &[u8]) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .unregister(pattern);
    }

    /// Sets or clears the per-instance default listener. When cleared,
    /// unmatched payloads go to the construction-time default.
    pub fn set_default_listener(&self, listener: Option<Arc<dyn ConnectionListener>>) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .set_default(listener);
    }
}

// ============================================================================
// Endpoints and migration
// ============================================================================

impl StreamConnection {
    /// Last known local endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().expect("endpoints lock poisoned").local
    }

    /// Last known remote endpoint.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().expect("endpoints lock poisoned").remote
    }

    /// Re-binds the connection to new endpoints, preserving (or restoring)
    /// its running state.
    ///
    /// An absent endpoint is a wildcard: `None` for the local address keeps
    /// an OS-assigned port, `None` for the remote keeps the current peer. If
    /// both requested endpoints already match the current ones this is a
    /// successful no-op.
    ///
    /// If the connection is running it is stopped first and its endpoints
    /// captured as rollback targets. On open failure the previous endpoints
    /// are restored and `Ok` returned (the migration failed but the
    /// connection recovered); without a rollback target, or when the
    /// rollback itself fails, the error propagates. Between the stop and a
    /// successful open the connection is fully down.
    #[instrument(skip(self), fields(name = %self.inner.core.name()))]
    pub fn set_socket_address(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let current = *self.inner.endpoints.lock().expect("endpoints lock poisoned");
        if current.satisfied_by(local, remote) {
            debug!("Requested endpoints already bound; nothing to do");
            return Ok(());
        }

        let was_running = self.inner.core.is_running();
        let rollback = if was_running {
            self.stop();
            Some(current)
        } else {
            // Release any held socket so a same-port rebind does not collide
            // with it. Not running means no rollback target.
            self.inner.close_transport();
            None
        };

        let target_remote = remote.or(current.remote).ok_or(Error::InvalidAddress)?;
        // Only re-pin a local port the caller chose deliberately; an
        // ephemeral port is not worth fighting the OS for.
        let target_local = local.or(if current.local_pinned { current.local } else { None });
        let connect_timeout = self.inner.core.tunables.connect_timeout;

        match self.inner.factory.open(target_local, target_remote, connect_timeout) {
            Ok(transport) => {
                self.inner.install_transport(transport, target_local.is_some())?;
                if self.inner.factory.secure() {
                    self.inner.fire_handshake_complete();
                }
                if was_running {
                    self.start()?;
                }
                info!(remote = %target_remote, "Migrated connection");
                Ok(())
            }
            Err(err) => {
                warn!(?err, remote = %target_remote, "Address migration failed");
                let Some(old) = rollback else {
                    return Err(err);
                };
                let Some(old_remote) = old.remote else {
                    return Err(err);
                };
                let old_local = if old.local_pinned { old.local } else { None };
                match self.inner.factory.open(old_local, old_remote, connect_timeout) {
                    Ok(transport) => {
                        self.inner.install_transport(transport, old.local_pinned)?;
                        if self.inner.factory.secure() {
                            self.inner.fire_handshake_complete();
                        }
                        self.start()?;
                        info!(remote = %old_remote, "Rolled back to previous endpoints");
                        Ok(())
                    }
                    Err(rollback_err) => {
                        error!(?rollback_err, "Rollback failed; connection is down");
                        Err(err)
                    }
                }
            }
        }
    }
}

// ============================================================================
// Worker loop
// ============================================================================

impl StreamInner {
    fn run(inner: Arc<StreamInner>) {
        inner.core.enter_loop();
        debug!(name = %inner.core.name(), "Stream worker started");

        let tunables = inner.core.tunables.clone();
        let mut buf = vec![0u8; tunables.recv_buffer_size];
        let mut term_err: Option<Error> = None;

        // TCP transports hand out an independent read handle so sends never
        // wait on the read deadline; TLS reads go through the shared lock.
        let mut reader: Option<Box<dyn StreamTransport>> = {
            let guard = inner.transport.lock().expect("transport lock poisoned");
            match guard.as_ref() {
                Some(transport) => transport.try_clone_reader().unwrap_or_else(|err| {
                    warn!(name = %inner.core.name(), ?err, "Could not clone read handle");
                    None
                }),
                None => None,
            }
        };

        let window = tunables.inactivity_timeout;
        let mut expiry = Instant::now() + window.unwrap_or_default();
        let mut interrupted = false;

        'read: while inner.core.is_started() {
            if window.is_some() && !interrupted {
                expiry = Instant::now() + window.unwrap_or_default();
            }
            interrupted = false;

            let result = match reader.as_mut() {
                Some(r) => r.read(&mut buf),
                None => match inner
                    .transport
                    .lock()
                    .expect("transport lock poisoned")
                    .as_mut()
                {
                    Some(transport) => transport.read(&mut buf),
                    None => break 'read,
                },
            };

            match result {
                Ok(0) => {
                    debug!(name = %inner.core.name(), "End of stream");
                    break 'read;
                }
                Ok(n) => inner.dispatch(&buf[..n]),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                    interrupted = true;
                }
                Err(ref err) if Error::is_timeout(err) => {
                    // Expected "no data yet" wakeup; only fatal once the
                    // inactivity window has fully elapsed.
                    if let Some(window) = window {
                        if Instant::now() > expiry {
                            warn!(name = %inner.core.name(), "Inactivity timeout");
                            term_err =
                                Some(Error::InactivityTimeout(window.as_millis() as u64));
                            break 'read;
                        }
                    }
                    interrupted = true;
                }
                Err(err) => {
                    warn!(name = %inner.core.name(), ?err, "Read error");
                    term_err = Some(err.into());
                    break 'read;
                }
            }
        }

        drop(reader);
        inner.close_transport();
        let event = TerminatedEvent {
            connection_id: inner.core.id(),
            error: term_err,
        };
        broadcast_terminated(&inner.registry, &event);
        inner.core.exit_loop();
        debug!(name = %inner.core.name(), "Stream worker exited");
    }

    fn dispatch(&self, payload: &[u8]) {
        let class = classify(payload.len(), &self.core.tunables);
        let event = DataEvent {
            connection_id: self.core.id(),
            payload,
            source: None,
        };
        dispatch_payload(&self.registry, &event, class);
    }

    fn install_transport(
        &self,
        mut transport: Box<dyn StreamTransport>,
        local_pinned: bool,
    ) -> Result<(), Error> {
        transport.set_read_timeout(Some(read_deadline(&self.core.tunables.socket_timeout)))?;
        let endpoints = Endpoints {
            local: transport.local_addr().ok(),
            remote: transport.peer_addr().ok(),
            local_pinned,
        };
        *self.transport.lock().expect("transport lock poisoned") = Some(transport);
        *self.endpoints.lock().expect("endpoints lock poisoned") = endpoints;
        Ok(())
    }

    fn close_transport(&self) {
        let transport = self.transport.lock().expect("transport lock poisoned").take();
        if let Some(mut transport) = transport {
            if let Err(err) = transport.shutdown() {
                warn!(name = %self.core.name(), ?err, "Error closing transport");
            }
        }
    }

    fn fire_handshake_complete(&self) {
        let event = HandshakeEvent {
            connection_id: self.core.id(),
            peer_addr: self.endpoints.lock().expect("endpoints lock poisoned").remote,
        };
        let default = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .default_listener();
        default.on_handshake_complete(&event);
    }
}
