//! Listening endpoint: accept fan-out, child dispatch, cascade stop, child
//! pruning, and rebind.

mod support;

use commlink::prelude::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{empty_config, fast_tunables, init_tracing, wait_until, Recorder};

const WAIT: Duration = Duration::from_secs(2);

// Records server events and keeps handles to accepted children.
#[derive(Default)]
struct ServerRecorder {
    incoming: Mutex<Vec<(u64, SocketAddr)>>,
    children: Mutex<Vec<StreamConnection>>,
    terminated: Mutex<Vec<Option<String>>>,
}

impl ServerRecorder {
    fn incoming_count(&self) -> usize {
        self.incoming.lock().unwrap().len()
    }

    fn terminated_count(&self) -> usize {
        self.terminated.lock().unwrap().len()
    }
}

impl ServerListener for ServerRecorder {
    fn on_incoming(&self, event: &IncomingEvent<'_>) {
        self.incoming
            .lock()
            .unwrap()
            .push((event.connection.id(), event.peer_addr));
        self.children.lock().unwrap().push(event.connection.clone());
    }

    fn on_server_terminated(&self, event: &TerminatedEvent) {
        self.terminated
            .lock()
            .unwrap()
            .push(event.error.as_ref().map(|e| e.to_string()));
    }
}

fn bind_server(
    server_listener: Arc<ServerRecorder>,
    child_listener: Arc<Recorder>,
) -> ServerConnection {
    init_tracing();
    let ctx = ServerContext::new(server_listener, child_listener)
        .with_tunables(fast_tunables())
        .with_child_tunables(fast_tunables());
    ServerConnection::bind(&empty_config(), ctx, "127.0.0.1:0").expect("bind server")
}

#[test]
fn accepted_connections_become_managed_children() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let server = bind_server(server_rec.clone(), child_rec.clone());
    let addr = server.local_addr().expect("server addr");

    let mut client = TcpStream::connect(addr).expect("client connect");
    assert!(wait_until(WAIT, || server.child_count() == 1));
    assert_eq!(server_rec.incoming_count(), 1);

    // Client bytes reach the child's default listener.
    client.write_all(b"hello server").expect("client write");
    assert!(wait_until(WAIT, || child_rec.data_count() == 1));
    assert_eq!(child_rec.payloads(), vec![b"hello server".to_vec()]);

    // The child handle handed to on_incoming can answer.
    let child = server_rec.children.lock().unwrap()[0].clone();
    child.send(b"hello client").expect("child send");
    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).expect("client read");
    assert_eq!(&buf[..n], b"hello client");

    server.stop();
}

#[test]
fn stopping_server_stops_all_children() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let server = bind_server(server_rec.clone(), child_rec.clone());
    let addr = server.local_addr().expect("server addr");

    let mut client_a = TcpStream::connect(addr).expect("client a");
    let mut client_b = TcpStream::connect(addr).expect("client b");
    assert!(wait_until(WAIT, || server.child_count() == 2));

    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.child_count(), 0);
    assert_eq!(server_rec.terminated_count(), 1);
    assert!(wait_until(WAIT, || child_rec.terminated_count() == 2));

    // Both clients observe the close.
    let mut buf = [0u8; 8];
    assert_eq!(client_a.read(&mut buf).unwrap_or(0), 0);
    assert_eq!(client_b.read(&mut buf).unwrap_or(0), 0);
}

#[test]
fn terminated_child_is_pruned_from_live_set() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let server = bind_server(server_rec, child_rec.clone());
    let addr = server.local_addr().expect("server addr");

    let client = TcpStream::connect(addr).expect("client connect");
    assert!(wait_until(WAIT, || server.child_count() == 1));

    drop(client);
    assert!(wait_until(WAIT, || server.child_count() == 0));
    assert_eq!(child_rec.terminated_count(), 1);

    server.stop();
}

#[test]
fn idle_server_beyond_inactivity_window_terminates() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let tunables = Tunables {
        inactivity_timeout: Some(Duration::from_millis(200)),
        ..fast_tunables()
    };
    let ctx = ServerContext::new(server_rec.clone(), child_rec)
        .with_tunables(tunables)
        .with_child_tunables(fast_tunables());
    let server =
        ServerConnection::bind(&empty_config(), ctx, "127.0.0.1:0").expect("bind server");

    // No client ever connects; the accept loop must give up on its own.
    assert!(wait_until(WAIT, || server.is_running()));
    assert!(wait_until(WAIT, || !server.is_running()));
    assert_eq!(server_rec.terminated_count(), 1);
    let terminated = server_rec.terminated.lock().unwrap();
    let reason = terminated[0].as_ref().expect("termination carries an error");
    assert!(reason.contains("Inactivity"), "unexpected reason: {reason}");
}

#[test]
fn accepted_connection_resets_server_inactivity_window() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let tunables = Tunables {
        inactivity_timeout: Some(Duration::from_millis(400)),
        ..fast_tunables()
    };
    let ctx = ServerContext::new(server_rec.clone(), child_rec)
        .with_tunables(tunables)
        .with_child_tunables(fast_tunables());
    let server =
        ServerConnection::bind(&empty_config(), ctx, "127.0.0.1:0").expect("bind server");
    let addr = server.local_addr().expect("server addr");

    // Keep connecting at half the window; the server must stay up well past
    // one full window.
    let mut clients = Vec::new();
    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(200));
        clients.push(TcpStream::connect(addr).expect("client connect"));
        assert!(server.is_running(), "server gave up despite steady accepts");
    }
    assert!(wait_until(WAIT, || server.child_count() == 4));

    server.stop();
}

#[test]
fn rebind_moves_listening_endpoint() {
    let server_rec = Arc::new(ServerRecorder::default());
    let child_rec = Arc::new(Recorder::default());
    let server = bind_server(server_rec.clone(), child_rec.clone());
    let old_addr = server.local_addr().expect("server addr");

    let _old_client = TcpStream::connect(old_addr).expect("client on old addr");
    assert!(wait_until(WAIT, || server.child_count() == 1));

    // Rebinding restarts the accept loop, stopping existing children and
    // firing one server-terminated event on the way.
    let new_local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    server
        .set_local_socket_address(new_local, None)
        .expect("rebind server");
    let new_addr = server.local_addr().expect("rebound addr");
    assert_ne!(new_addr, old_addr);
    assert!(wait_until(WAIT, || server.is_running()));
    assert_eq!(server_rec.terminated_count(), 1);
    assert_eq!(server.child_count(), 0);

    let mut client = TcpStream::connect(new_addr).expect("client on new addr");
    assert!(wait_until(WAIT, || server.child_count() == 1));
    client.write_all(b"on the new port").expect("client write");
    assert!(wait_until(WAIT, || child_rec.data_count() == 1));

    server.stop();
}

#[test]
fn replacing_child_default_applies_to_new_children_only() {
    let server_rec = Arc::new(ServerRecorder::default());
    let first_default = Arc::new(Recorder::default());
    let second_default = Arc::new(Recorder::default());
    let server = bind_server(server_rec, first_default.clone());
    let addr = server.local_addr().expect("server addr");

    let mut client_a = TcpStream::connect(addr).expect("client a");
    assert!(wait_until(WAIT, || server.child_count() == 1));

    server.set_default_child_listener(second_default.clone());
    let mut client_b = TcpStream::connect(addr).expect("client b");
    assert!(wait_until(WAIT, || server.child_count() == 2));

    client_a.write_all(b"first").expect("client a write");
    assert!(wait_until(WAIT, || first_default.data_count() == 1));
    client_b.write_all(b"second").expect("client b write");
    assert!(wait_until(WAIT, || second_default.data_count() == 1));
    assert_eq!(first_default.data_count(), 1);

    server.stop();
}
