//! Shared helpers for the integration tests: a recording listener and a
//! condition poller.

#![allow(dead_code)]

use commlink::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Records every callback it receives, for assertions after the fact.
#[derive(Default)]
pub struct Recorder {
    pub data: Mutex<Vec<(u64, Vec<u8>, Option<SocketAddr>)>>,
    pub undersized: Mutex<Vec<Vec<u8>>>,
    pub oversized: Mutex<Vec<Vec<u8>>>,
    pub terminated: Mutex<Vec<(u64, Option<String>)>>,
    pub handshakes: AtomicUsize,
}

impl Recorder {
    pub fn data_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.lock().unwrap().len()
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

impl ConnectionListener for Recorder {
    fn on_data(&self, event: &DataEvent<'_>) {
        self.data.lock().unwrap().push((
            event.connection_id,
            event.payload.to_vec(),
            event.source,
        ));
    }

    fn on_undersized(&self, event: &DataEvent<'_>) {
        self.undersized.lock().unwrap().push(event.payload.to_vec());
    }

    fn on_oversized(&self, event: &DataEvent<'_>) {
        self.oversized.lock().unwrap().push(event.payload.to_vec());
    }

    fn on_terminated(&self, event: &TerminatedEvent) {
        self.terminated.lock().unwrap().push((
            event.connection_id,
            event.error.as_ref().map(|e| e.to_string()),
        ));
    }

    fn on_handshake_complete(&self, _event: &HandshakeEvent) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Installs the fmt subscriber so worker traces show up under
/// `--nocapture`. Safe to call from every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Polls `cond` until it holds or `timeout` elapses. Returns the final value.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Tunables with short deadlines so tests settle quickly.
pub fn fast_tunables() -> Tunables {
    Tunables {
        socket_timeout: Duration::from_millis(50),
        ..Tunables::default()
    }
}

/// A config with no keys set; every tunable falls back to its default.
pub fn empty_config() -> config::Config {
    config::Config::builder().build().unwrap()
}

/// Opens a stream connection against a plain std listener so the peer side
/// can read and write raw bytes directly.
pub fn connect_pair(ctx: ConnectionContext) -> (StreamConnection, std::net::TcpStream) {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind peer listener");
    let addr = listener.local_addr().unwrap();
    let conn = StreamConnection::connect(&empty_config(), ctx, addr).expect("connect");
    let (peer, _) = listener.accept().expect("accept");
    (conn, peer)
}
