//! The connection lifecycle and dispatch engine.
//!
//! Every connection owns one dedicated worker thread performing blocking,
//! deadline-bounded I/O. The worker observes the `started` flag at the top
//! of each loop iteration and on wake from a bounded read, so `stop()` is
//! cooperative: it is "requested" until the worker-alive flag clears.
//!
//! Connection kinds are assembled by composition: a [`ConnectionCore`] for
//! lifecycle state, a mutex-wrapped [`ListenerRegistry`] for dispatch, and a
//! transport capability from [`crate::transport`].

mod datagram;
mod server;
mod stream;

pub use datagram::DatagramConnection;
pub use server::ServerConnection;
pub use stream::StreamConnection;

use crate::config::Tunables;
use crate::listener::{
    ConnectionListener, DataEvent, ListenerRegistry, MatchMode, ServerListener, TerminatedEvent,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

// Process-wide connection identity counter. Ids appear in events and thread
// names, and key the server's live-children map.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A seed registration applied to a connection's registry at construction.
pub type SeedRegistration = (Vec<u8>, Arc<dyn ConnectionListener>, MatchMode);

/// Constructor inputs for stream and datagram connections.
///
/// The default listener is a required argument: default-listener resolution
/// must never come up empty, so there is no late-bound process-wide fallback
/// to forget to initialize.
pub struct ConnectionContext {
    /// Worker-loop tunables (buffer size, deadlines, size bounds).
    pub tunables: Tunables,
    /// Fallback recipient for payloads no pattern matches.
    pub default_listener: Arc<dyn ConnectionListener>,
    /// Pattern registrations seeded into the registry, in match order.
    pub registrations: Vec<SeedRegistration>,
    /// Start the worker before the constructor returns.
    pub auto_start: bool,
}

impl ConnectionContext {
    /// Context with default tunables, no seed registrations, auto-start on.
    pub fn new(default_listener: Arc<dyn ConnectionListener>) -> Self {
        Self {
            tunables: Tunables::default(),
            default_listener,
            registrations: Vec::new(),
            auto_start: true,
        }
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_registration(
        mut self,
        pattern: &[u8],
        listener: Arc<dyn ConnectionListener>,
        mode: MatchMode,
    ) -> Self {
        self.registrations.push((pattern.to_vec(), listener, mode));
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Constructor inputs for listening (server) connections.
pub struct ServerContext {
    /// Accept-loop tunables. `socket_timeout` bounds each blocking accept.
    pub tunables: Tunables,
    /// Tunables applied to every accepted child connection.
    pub child_tunables: Tunables,
    /// Fallback recipient for server events.
    pub default_listener: Arc<dyn ServerListener>,
    /// Default listener installed on every accepted child.
    pub child_default_listener: Arc<dyn ConnectionListener>,
    /// Pending-accept queue depth.
    pub backlog: i32,
    /// Start the accept loop before the constructor returns.
    pub auto_start: bool,
}

impl ServerContext {
    /// Context with default tunables and backlog, auto-start on.
    pub fn new(
        default_listener: Arc<dyn ServerListener>,
        child_default_listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        Self {
            tunables: Tunables::default(),
            child_tunables: Tunables::default(),
            default_listener,
            child_default_listener,
            backlog: 128,
            auto_start: true,
        }
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_child_tunables(mut self, tunables: Tunables) -> Self {
        self.child_tunables = tunables;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

// Last known endpoints of a connection. `local_pinned` records whether the
// local address was explicitly requested by the caller, so migration and
// rollback only re-pin local ports that were deliberately chosen.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Endpoints {
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) local_pinned: bool,
}

impl Endpoints {
    // Wildcard endpoint equality: an absent requested endpoint matches any
    // current one.
    pub(crate) fn satisfied_by(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> bool {
        let local_same = local.is_none() || local == self.local;
        let remote_same = remote.is_none() || remote == self.remote;
        local_same && remote_same
    }
}

// ============================================================================
// Lifecycle base
// ============================================================================

/// Lifecycle state shared by every connection kind: intent flag, worker-alive
/// flag, and ownership of the worker thread handle.
pub(crate) struct ConnectionCore {
    id: u64,
    name: String,
    started: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) tunables: Tunables,
}

impl ConnectionCore {
    pub(crate) fn new(kind: &str, tunables: Tunables) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            name: format!("{kind}-{id}"),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            tunables,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // Flags the start intent. Returns false if already started.
    pub(crate) fn begin_start(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    // Undoes begin_start when the worker failed to spawn.
    pub(crate) fn abort_start(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub(crate) fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().expect("worker lock poisoned") = Some(handle);
    }

    // Clearing `started` is the only authorized signal for the worker to
    // exit its loop.
    pub(crate) fn request_stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    // Waits for the worker to drain, unless called from the worker itself:
    // a listener callback invoking stop() from inside the loop must not join
    // its own thread.
    pub(crate) fn join_worker(&self) {
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!(name = %self.name, "Stop requested from worker thread; skipping self-join");
                return;
            }
            if handle.join().is_err() {
                warn!(name = %self.name, "Worker thread panicked");
            }
        }
    }

    // Worker entry/exit bookkeeping.
    pub(crate) fn enter_loop(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn exit_loop(&self) {
        // Exit for any reason clears the start intent, so is_started()
        // reflects reality and a later start() actually restarts.
        self.started.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn spawn_worker<F>(&self, f: F) -> Result<(), crate::error::Error>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(self.name.clone()).spawn(f) {
            Ok(handle) => {
                self.attach_worker(handle);
                Ok(())
            }
            Err(err) => {
                self.abort_start();
                Err(err.into())
            }
        }
    }
}

// A zero read deadline would mean "block forever" on some platforms and is
// rejected on others; clamp to the smallest effective deadline.
pub(crate) fn read_deadline(socket_timeout: &Duration) -> Duration {
    if socket_timeout.is_zero() {
        Duration::from_millis(1)
    } else {
        *socket_timeout
    }
}

// ============================================================================
// Dispatch helpers
// ============================================================================

// Size classification of a received payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketClass {
    Undersized,
    Normal,
    Oversized,
}

pub(crate) fn classify(len: usize, tunables: &Tunables) -> PacketClass {
    if len < tunables.min_packet_len {
        PacketClass::Undersized
    } else if len > tunables.max_packet_len {
        PacketClass::Oversized
    } else {
        PacketClass::Normal
    }
}

// Resolves the target listener by pattern (falling back to the default) and
// delivers the classified event. The registry lock is released before the
// callback runs, so callbacks may mutate the registry or stop the connection.
pub(crate) fn dispatch_payload(
    registry: &Mutex<ListenerRegistry<dyn ConnectionListener>>,
    event: &DataEvent<'_>,
    class: PacketClass,
) {
    let target = {
        let registry = registry.lock().expect("registry lock poisoned");
        registry
            .resolve(event.payload)
            .unwrap_or_else(|| registry.default_listener())
    };
    match class {
        PacketClass::Undersized => target.on_undersized(event),
        PacketClass::Oversized => target.on_oversized(event),
        PacketClass::Normal => target.on_data(event),
    }
}

// Terminal broadcast: every registered listener and the default listener,
// unconditionally. Not pattern-matched.
pub(crate) fn broadcast_terminated(
    registry: &Mutex<ListenerRegistry<dyn ConnectionListener>>,
    event: &TerminatedEvent,
) {
    let (listeners, default) = {
        let registry = registry.lock().expect("registry lock poisoned");
        (registry.snapshot(), registry.default_listener())
    };
    for listener in &listeners {
        listener.on_terminated(event);
    }
    default.on_terminated(event);
}
