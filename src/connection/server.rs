//! Listening endpoint producing accepted child stream connections.

use super::{ConnectionContext, ConnectionCore, Endpoints, ServerContext, StreamConnection};
use crate::config::{get_namespaced_value, Tunables};
use crate::error::Error;
use crate::listener::{
    ConnectionListener, IncomingEvent, ListenerRegistry, MatchMode, ServerListener,
    TerminatedEvent,
};
use crate::transport::{
    acceptor_factory_from_config, stream_factory_from_config, Acceptor, AcceptorFactory,
    StreamFactory, StreamTransport,
};

use ::config::Config;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub(crate) struct ServerInner {
    core: ConnectionCore,
    registry: Mutex<ListenerRegistry<dyn ServerListener>>,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    endpoints: Mutex<Endpoints>,
    factory: Arc<dyn AcceptorFactory>,
    // Factory handed to accepted children so they support the same
    // re-open-based migration as outbound connections.
    child_factory: Arc<dyn StreamFactory>,
    children: Mutex<HashMap<u64, StreamConnection>>,
    child_tunables: Tunables,
    child_default_listener: Mutex<Arc<dyn ConnectionListener>>,
    backlog: AtomicI32,
}

/// A listening connection whose worker accepts incoming streams and wraps
/// each in a [`StreamConnection`] child.
///
/// The server tracks its live children: each child carries a watcher that
/// prunes it from the set on termination, and stopping the server stops
/// every remaining child before the server-terminated event fires.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<ServerInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerConnection {
    /// Binds a listening endpoint at `local` using the transport selected by
    /// the `transport_type` configuration key ("tcp" or "tls").
    pub fn bind<A: ToSocketAddrs>(
        config: &Config,
        ctx: ServerContext,
        local: A,
    ) -> Result<Self, Error> {
        Self::bind_named(config, "", ctx, local)
    }

    /// Like [`bind`](Self::bind) with configuration namespacing:
    /// `{name}.{key}` takes priority over `{key}`.
    pub fn bind_named<A: ToSocketAddrs>(
        config: &Config,
        name: &str,
        ctx: ServerContext,
        local: A,
    ) -> Result<Self, Error> {
        let factory = acceptor_factory_from_config(config, name)?;
        let child_factory = stream_factory_from_config(config, name)?;
        let local = local
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let backlog = get_namespaced_value(config, name, "backlog", |cfg, key| {
            cfg.get::<i32>(key)
        })
        .unwrap_or(ctx.backlog);

        let inner = Arc::new(ServerInner {
            core: ConnectionCore::new("server", ctx.tunables),
            registry: Mutex::new(ListenerRegistry::new(ctx.default_listener)),
            acceptor: Mutex::new(None),
            endpoints: Mutex::new(Endpoints::default()),
            factory,
            child_factory,
            children: Mutex::new(HashMap::new()),
            child_tunables: ctx.child_tunables,
            child_default_listener: Mutex::new(ctx.child_default_listener),
            backlog: AtomicI32::new(backlog),
        });
        inner.install_acceptor(local)?;

        let server = Self { inner };
        info!(
            name = %server.inner.core.name(),
            local_addr = ?server.local_addr(),
            "Bound listening endpoint"
        );
        if ctx.auto_start {
            server.start()?;
        }
        Ok(server)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl ServerConnection {
    /// Unique identity of this server, as carried by its events.
    pub fn id(&self) -> u64 {
        self.inner.core.id()
    }

    /// Whether a start has been requested and not yet stopped.
    pub fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    /// Whether the accept loop is currently executing.
    pub fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    /// Spawns the accept loop. No-op if already started.
    pub fn start(&self) -> Result<(), Error> {
        if !self.inner.core.begin_start() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.inner.core.spawn_worker(move || ServerInner::run(inner))
    }

    /// Requests the accept loop to exit, stops every live child, and closes
    /// the listening socket. Blocks until the loop drains unless called from
    /// the accept thread itself.
    #[instrument(skip(self), fields(name = %self.inner.core.name()))]
    pub fn stop(&self) {
        self.inner.core.request_stop();
        self.inner.core.join_worker();
        // The worker exit path stops children and closes the acceptor; this
        // covers a stop before any start.
        self.inner.stop_children();
        self.inner.close_acceptor();
    }

    /// Number of live accepted children.
    pub fn child_count(&self) -> usize {
        self.inner.children.lock().expect("children lock poisoned").len()
    }
}

// ============================================================================
// Listener management
// ============================================================================

impl ServerConnection {
    /// Registers a server listener under an opaque key. Keys only identify
    /// the registration (for [`remove_listener`](Self::remove_listener));
    /// every registered listener receives every server event.
    pub fn add_listener(&self, key: &[u8], listener: Arc<dyn ServerListener>) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .register(key, listener, MatchMode::None);
    }

    /// Removes the registration under `key`. No-op if absent.
    pub fn remove_listener(&self, key: &[u8]) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .unregister(key);
    }

    /// Sets or clears the per-instance default server listener.
    pub fn set_default_listener(&self, listener: Option<Arc<dyn ServerListener>>) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .set_default(listener);
    }

    /// Replaces the default listener installed on children accepted from now
    /// on. Already-accepted children keep theirs.
    pub fn set_default_child_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self
            .inner
            .child_default_listener
            .lock()
            .expect("child default lock poisoned") = listener;
    }
}

// ============================================================================
// Endpoints and rebind
// ============================================================================

impl ServerConnection {
    /// Bound listening endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().expect("endpoints lock poisoned").local
    }

    /// Re-binds the listening endpoint to a new local address and optionally
    /// a new backlog depth (`None` keeps the current one).
    ///
    /// A running server is stopped first, which stops its live children and
    /// fires the server-terminated event; the accept loop then restarts on
    /// the new address. If the requested address is already bound and the
    /// backlog unchanged this is a successful no-op. On bind failure the
    /// previous address and backlog are restored and `Ok` returned; without
    /// a rollback target, or when the rollback itself fails, the error
    /// propagates.
    #[instrument(skip(self), fields(name = %self.inner.core.name()))]
    pub fn set_local_socket_address(
        &self,
        local: SocketAddr,
        backlog: Option<i32>,
    ) -> Result<(), Error> {
        let current = *self.inner.endpoints.lock().expect("endpoints lock poisoned");
        let old_backlog = self.inner.backlog.load(Ordering::Acquire);
        let backlog_same = backlog.is_none() || backlog == Some(old_backlog);
        if current.satisfied_by(Some(local), None) && backlog_same {
            debug!("Requested endpoint already bound; nothing to do");
            return Ok(());
        }
        if let Some(backlog) = backlog {
            self.inner.backlog.store(backlog, Ordering::Release);
        }

        let was_running = self.inner.core.is_running();
        let rollback = if was_running {
            self.stop();
            Some(current)
        } else {
            self.inner.close_acceptor();
            None
        };

        match self.inner.install_acceptor(local) {
            Ok(()) => {
                if was_running {
                    self.start()?;
                }
                info!(%local, "Rebound listening endpoint");
                Ok(())
            }
            Err(err) => {
                warn!(?err, %local, "Listener rebind failed");
                let Some(old) = rollback else {
                    return Err(err);
                };
                let Some(old_local) = old.local else {
                    return Err(err);
                };
                self.inner.backlog.store(old_backlog, Ordering::Release);
                match self.inner.install_acceptor(old_local) {
                    Ok(()) => {
                        self.start()?;
                        info!(local = %old_local, "Rolled back to previous endpoint");
                        Ok(())
                    }
                    Err(rollback_err) => {
                        error!(?rollback_err, "Rollback failed; server is down");
                        Err(err)
                    }
                }
            }
        }
    }
}

// ============================================================================
// Accept loop
// ============================================================================

impl ServerInner {
    fn run(inner: Arc<ServerInner>) {
        inner.core.enter_loop();
        debug!(name = %inner.core.name(), "Accept loop started");

        let mut term_err: Option<Error> = None;

        let window = inner.core.tunables.inactivity_timeout;
        let mut expiry = Instant::now() + window.unwrap_or_default();
        let mut interrupted = false;

        'accept: while inner.core.is_started() {
            if window.is_some() && !interrupted {
                expiry = Instant::now() + window.unwrap_or_default();
            }
            interrupted = false;

            let result = {
                let guard = inner.acceptor.lock().expect("acceptor lock poisoned");
                match guard.as_ref() {
                    Some(acceptor) => acceptor.accept(),
                    None => break 'accept,
                }
            };

            match result {
                Ok((transport, peer_addr)) => {
                    Self::handle_accept(&inner, transport, peer_addr);
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                    interrupted = true;
                }
                Err(ref err) if Error::is_timeout(err) => {
                    // No pending connection within the accept deadline; only
                    // fatal once the inactivity window has fully elapsed.
                    if let Some(window) = window {
                        if Instant::now() > expiry {
                            warn!(name = %inner.core.name(), "Inactivity timeout");
                            term_err =
                                Some(Error::InactivityTimeout(window.as_millis() as u64));
                            break 'accept;
                        }
                    }
                    interrupted = true;
                }
                Err(ref err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    // The peer gave up (or failed its handshake) before we
                    // finished accepting; only that connection is lost.
                    debug!(name = %inner.core.name(), ?err, "Connection aborted during accept");
                }
                Err(err) => {
                    warn!(name = %inner.core.name(), ?err, "Accept error");
                    term_err = Some(err.into());
                    break 'accept;
                }
            }
        }

        inner.stop_children();
        inner.close_acceptor();
        let event = TerminatedEvent {
            connection_id: inner.core.id(),
            error: term_err,
        };
        inner.broadcast_server_terminated(&event);
        inner.core.exit_loop();
        debug!(name = %inner.core.name(), "Accept loop exited");
    }

    fn handle_accept(
        inner: &Arc<ServerInner>,
        transport: Box<dyn StreamTransport>,
        peer_addr: SocketAddr,
    ) {
        let child_ctx = ConnectionContext {
            tunables: inner.child_tunables.clone(),
            default_listener: Arc::clone(
                &inner
                    .child_default_listener
                    .lock()
                    .expect("child default lock poisoned"),
            ),
            registrations: Vec::new(),
            auto_start: false,
        };
        let secure = inner.factory.secure();

        let child = match StreamConnection::from_parts(
            Arc::clone(&inner.child_factory),
            child_ctx,
            transport,
            false,
            secure,
        ) {
            Ok(child) => child,
            Err(err) => {
                warn!(name = %inner.core.name(), ?err, %peer_addr, "Failed to assemble accepted connection");
                return;
            }
        };

        let child_id = child.id();
        info!(name = %inner.core.name(), child_id, %peer_addr, "Accepted connection");

        // The watcher prunes the child from the live set when its worker
        // exits. Keyed by child id; never content-matched.
        let watcher: Arc<dyn ConnectionListener> = Arc::new(ChildWatcher {
            server: Arc::downgrade(inner),
        });
        child.add_listener(
            format!("child-watch-{child_id}").as_bytes(),
            watcher,
            MatchMode::None,
        );
        inner
            .children
            .lock()
            .expect("children lock poisoned")
            .insert(child_id, child.clone());

        // Listeners see the child before it starts reading, so they can
        // register pattern listeners without racing the first payload.
        let event = IncomingEvent {
            server_id: inner.core.id(),
            connection: &child,
            peer_addr,
        };
        let (listeners, default) = {
            let registry = inner.registry.lock().expect("registry lock poisoned");
            (registry.snapshot(), registry.default_listener())
        };
        for listener in &listeners {
            listener.on_incoming(&event);
        }
        default.on_incoming(&event);

        if let Err(err) = child.start() {
            warn!(name = %inner.core.name(), child_id, ?err, "Failed to start accepted connection");
            inner
                .children
                .lock()
                .expect("children lock poisoned")
                .remove(&child_id);
        }
    }

    // Drains the live set before stopping, so child termination callbacks
    // (which prune the set) never contend with this loop over the lock.
    fn stop_children(&self) {
        let children: Vec<StreamConnection> = {
            let mut map = self.children.lock().expect("children lock poisoned");
            map.drain().map(|(_, child)| child).collect()
        };
        for child in children {
            child.stop();
        }
    }

    fn broadcast_server_terminated(&self, event: &TerminatedEvent) {
        let (listeners, default) = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            (registry.snapshot(), registry.default_listener())
        };
        for listener in &listeners {
            listener.on_server_terminated(event);
        }
        default.on_server_terminated(event);
    }

    fn install_acceptor(&self, local: SocketAddr) -> Result<(), Error> {
        let acceptor = self.factory.bind(local, self.backlog.load(Ordering::Acquire))?;
        acceptor.set_accept_timeout(Some(super::read_deadline(
            &self.core.tunables.socket_timeout,
        )))?;
        let endpoints = Endpoints {
            local: acceptor.local_addr().ok(),
            remote: None,
            local_pinned: true,
        };
        *self.acceptor.lock().expect("acceptor lock poisoned") = Some(acceptor);
        *self.endpoints.lock().expect("endpoints lock poisoned") = endpoints;
        Ok(())
    }

    fn close_acceptor(&self) {
        self.acceptor.lock().expect("acceptor lock poisoned").take();
    }
}

// Prunes a terminated child from the server's live set. Holds only a weak
// server reference so children never keep a stopped server alive.
struct ChildWatcher {
    server: Weak<ServerInner>,
}

impl ConnectionListener for ChildWatcher {
    fn on_terminated(&self, event: &TerminatedEvent) {
        if let Some(server) = self.server.upgrade() {
            let removed = server
                .children
                .lock()
                .expect("children lock poisoned")
                .remove(&event.connection_id)
                .is_some();
            if removed {
                debug!(
                    name = %server.core.name(),
                    child_id = event.connection_id,
                    "Pruned terminated child"
                );
            }
        }
    }
}
