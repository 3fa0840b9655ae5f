//! Connectionless datagram endpoint with the same worker-loop and dispatch
//! contract as the stream connection.

use super::{
    broadcast_terminated, classify, dispatch_payload, read_deadline, ConnectionCore,
    ConnectionContext, Endpoints,
};
use crate::error::Error;
use crate::listener::{ConnectionListener, DataEvent, ListenerRegistry, MatchMode, TerminatedEvent};
use crate::transport::{datagram_factory_from_config, DatagramFactory, DatagramTransport};

use ::config::Config;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

struct DatagramInner {
    core: ConnectionCore,
    registry: Mutex<ListenerRegistry<dyn ConnectionListener>>,
    transport: Mutex<Option<Arc<dyn DatagramTransport>>>,
    endpoints: Mutex<Endpoints>,
    factory: Arc<dyn DatagramFactory>,
}

/// A packet-oriented connection over a bound UDP socket.
///
/// Each received packet is dispatched as one payload carrying its source
/// address. A zero-length packet is valid data and never terminates the
/// connection. Sends go to an explicit destination
/// ([`send_to`](Self::send_to)) or to the default peer bound at construction
/// ([`send`](Self::send)).
#[derive(Clone)]
pub struct DatagramConnection {
    inner: Arc<DatagramInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl DatagramConnection {
    /// Binds a datagram endpoint at `local`, optionally connected to a
    /// default `peer` for [`send`](Self::send).
    pub fn bind<A: ToSocketAddrs>(
        config: &Config,
        ctx: ConnectionContext,
        local: A,
        peer: Option<SocketAddr>,
    ) -> Result<Self, Error> {
        Self::bind_named(config, "", ctx, local, peer)
    }

    /// Like [`bind`](Self::bind) with configuration namespacing:
    /// `{name}.{key}` takes priority over `{key}`.
    pub fn bind_named<A: ToSocketAddrs>(
        config: &Config,
        name: &str,
        ctx: ConnectionContext,
        local: A,
        peer: Option<SocketAddr>,
    ) -> Result<Self, Error> {
        let factory = datagram_factory_from_config(config, name)?;
        let local = local
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let transport = factory.bind(local, peer)?;
        transport.set_read_timeout(Some(read_deadline(&ctx.tunables.socket_timeout)))?;

        let endpoints = Endpoints {
            local: transport.local_addr().ok(),
            remote: transport.peer_addr(),
            local_pinned: true,
        };

        let mut registry = ListenerRegistry::new(ctx.default_listener);
        for (pattern, listener, mode) in ctx.registrations {
            registry.register(&pattern, listener, mode);
        }

        let inner = Arc::new(DatagramInner {
            core: ConnectionCore::new("datagram", ctx.tunables),
            registry: Mutex::new(registry),
            transport: Mutex::new(Some(transport)),
            endpoints: Mutex::new(endpoints),
            factory,
        });
        let connection = Self { inner };

        if ctx.auto_start {
            connection.start()?;
        }
        Ok(connection)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl DatagramConnection {
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
        self.inner
            .core
            .spawn_worker(move || DatagramInner::run(inner))
    }

    /// Requests the worker to exit and releases the socket. Blocks until the
    /// worker drains unless called from the worker thread itself.
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

impl DatagramConnection {
    /// Sends one packet to `addr`.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        let transport = self.inner.current_transport()?;
        let sent = transport.send_to(data, addr)?;
        debug!(name = %self.inner.core.name(), len = sent, %addr, "Sent datagram");
        Ok(())
    }

    /// Sends one packet to the default peer. Fails with
    /// [`Error::NoDefaultPeer`] when none was bound.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let transport = self.inner.current_transport()?;
        let sent = transport.send(data)?;
        debug!(name = %self.inner.core.name(), len = sent, "Sent datagram to default peer");
        Ok(())
    }
}

// ============================================================================
// Listener management
// ============================================================================

impl DatagramConnection {
    /// Registers a listener for payloads matching `pattern` under `mode`.
    /// Empty patterns are ignored; a byte-identical pattern overwrites in
    /// place.
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

    /// Sets or clears the per-instance default listener.
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

impl DatagramConnection {
    /// Bound local endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().expect("endpoints lock poisoned").local
    }

    /// Default peer, if one was bound.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().expect("endpoints lock poisoned").remote
    }

    /// Re-binds the endpoint to a new local address and/or default peer,
    /// preserving its running state.
    ///
    /// An absent argument keeps the current value. If the requested
    /// endpoints already match this is a successful no-op. On bind failure
    /// the previous endpoints are restored and `Ok` returned; without a
    /// rollback target, or when the rollback itself fails, the error
    /// propagates.
    #[instrument(skip(self), fields(name = %self.inner.core.name()))]
    pub fn set_socket_address(
        &self,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let current = *self.inner.endpoints.lock().expect("endpoints lock poisoned");
        if current.satisfied_by(local, peer) {
            debug!("Requested endpoints already bound; nothing to do");
            return Ok(());
        }

        let was_running = self.inner.core.is_running();
        let rollback = if was_running {
            self.stop();
            Some(current)
        } else {
            // Release the held socket so a same-port rebind does not collide
            // with it. Not running means no rollback target.
            self.inner.close_transport();
            None
        };

        let target_local = local.or(current.local).ok_or(Error::InvalidAddress)?;
        let target_peer = peer.or(current.remote);

        match self.inner.install_binding(target_local, target_peer) {
            Ok(()) => {
                if was_running {
                    self.start()?;
                }
                info!(local = %target_local, "Rebound datagram endpoint");
                Ok(())
            }
            Err(err) => {
                warn!(?err, local = %target_local, "Datagram rebind failed");
                let Some(old) = rollback else {
                    return Err(err);
                };
                let Some(old_local) = old.local else {
                    return Err(err);
                };
                match self.inner.install_binding(old_local, old.remote) {
                    Ok(()) => {
                        self.start()?;
                        info!(local = %old_local, "Rolled back to previous endpoints");
                        Ok(())
                    }
                    Err(rollback_err) => {
                        error!(?rollback_err, "Rollback failed; endpoint is down");
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

impl DatagramInner {
    fn run(inner: Arc<DatagramInner>) {
        inner.core.enter_loop();
        debug!(name = %inner.core.name(), "Datagram worker started");

        let tunables = inner.core.tunables.clone();
        let mut buf = vec![0u8; tunables.recv_buffer_size];
        let mut term_err: Option<Error> = None;

        let window = tunables.inactivity_timeout;
        let mut expiry = Instant::now() + window.unwrap_or_default();
        let mut interrupted = false;

        'recv: while inner.core.is_started() {
            if window.is_some() && !interrupted {
                expiry = Instant::now() + window.unwrap_or_default();
            }
            interrupted = false;

            // Clone the shared handle out so sends never contend with the
            // blocking receive.
            let Ok(transport) = inner.current_transport() else {
                break 'recv;
            };

            match transport.recv_from(&mut buf) {
                // Zero-length datagrams are real packets, dispatched as such.
                Ok((n, source)) => inner.dispatch(&buf[..n], source),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                    interrupted = true;
                }
                Err(ref err) if Error::is_timeout(err) => {
                    if let Some(window) = window {
                        if Instant::now() > expiry {
                            warn!(name = %inner.core.name(), "Inactivity timeout");
                            term_err =
                                Some(Error::InactivityTimeout(window.as_millis() as u64));
                            break 'recv;
                        }
                    }
                    interrupted = true;
                }
                // A previous send to an unreachable peer can surface here as
                // a reset; the socket itself is still usable.
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => {
                    debug!(name = %inner.core.name(), "Receive reset; continuing");
                }
                Err(err) => {
                    warn!(name = %inner.core.name(), ?err, "Receive error");
                    term_err = Some(err.into());
                    break 'recv;
                }
            }
        }

        inner.close_transport();
        let event = TerminatedEvent {
            connection_id: inner.core.id(),
            error: term_err,
        };
        broadcast_terminated(&inner.registry, &event);
        inner.core.exit_loop();
        debug!(name = %inner.core.name(), "Datagram worker exited");
    }

    fn dispatch(&self, payload: &[u8], source: SocketAddr) {
        let class = classify(payload.len(), &self.core.tunables);
        let event = DataEvent {
            connection_id: self.core.id(),
            payload,
            source: Some(source),
        };
        dispatch_payload(&self.registry, &event, class);
    }

    fn current_transport(&self) -> Result<Arc<dyn DatagramTransport>, Error> {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .as_ref()
            .cloned()
            .ok_or(Error::NotConnected)
    }

    fn install_binding(&self, local: SocketAddr, peer: Option<SocketAddr>) -> Result<(), Error> {
        let transport = self.factory.bind(local, peer)?;
        transport.set_read_timeout(Some(read_deadline(&self.core.tunables.socket_timeout)))?;
        let endpoints = Endpoints {
            local: transport.local_addr().ok(),
            remote: transport.peer_addr(),
            local_pinned: true,
        };
        *self.transport.lock().expect("transport lock poisoned") = Some(transport);
        *self.endpoints.lock().expect("endpoints lock poisoned") = endpoints;
        Ok(())
    }

    fn close_transport(&self) {
        // Dropping the handle closes the socket once the worker's clone is
        // gone; UDP has no shutdown handshake.
        self.transport.lock().expect("transport lock poisoned").take();
    }
}
