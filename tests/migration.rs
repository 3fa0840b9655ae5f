//! Address migration: wildcard no-ops, moving to a new peer, rollback on
//! failure, and failure without a rollback target.

mod support;

use commlink::prelude::*;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use support::{connect_pair, empty_config, fast_tunables, wait_until, Recorder};

const WAIT: Duration = Duration::from_secs(2);

// An address nothing listens on: bind, read the port, drop the listener.
fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn migration_to_matching_endpoints_is_noop() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let (conn, _peer) = connect_pair(ctx);
    assert!(wait_until(WAIT, || conn.is_running()));

    let peer_addr = conn.peer_addr().expect("peer addr");
    conn.set_socket_address(None, Some(peer_addr))
        .expect("matching endpoints are a no-op");
    conn.set_socket_address(None, None)
        .expect("all-wildcard request is a no-op");

    // No restart happened, so no terminated event was fired.
    assert!(conn.is_running());
    assert_eq!(recorder.terminated_count(), 0);

    conn.stop();
}

#[test]
fn migration_moves_to_new_peer() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let (conn, _old_peer) = connect_pair(ctx);
    assert!(wait_until(WAIT, || conn.is_running()));

    let new_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let new_addr = new_listener.local_addr().unwrap();

    conn.set_socket_address(None, Some(new_addr))
        .expect("migration to a live peer");
    assert_eq!(conn.peer_addr(), Some(new_addr));
    assert!(wait_until(WAIT, || conn.is_running()));

    // The restart cycle fires one terminated event for the old worker.
    assert_eq!(recorder.terminated_count(), 1);

    // Data flows over the new transport.
    let (mut new_peer, _) = new_listener.accept().expect("accept migrated connection");
    new_peer.write_all(b"after move").expect("peer write");
    assert!(wait_until(WAIT, || recorder.data_count() == 1));
    assert_eq!(recorder.payloads(), vec![b"after move".to_vec()]);

    conn.stop();
}

#[test]
fn failed_migration_rolls_back_to_previous_peer() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let old_addr = listener.local_addr().unwrap();
    let conn =
        StreamConnection::connect(&empty_config(), ctx, old_addr).expect("connect");
    let (_old_peer, _) = listener.accept().expect("accept");
    assert!(wait_until(WAIT, || conn.is_running()));

    // The target refuses connections; the old endpoints must be restored and
    // the call must report recovery, not failure.
    conn.set_socket_address(None, Some(dead_addr()))
        .expect("rollback recovers the connection");
    assert_eq!(conn.peer_addr(), Some(old_addr));
    assert!(wait_until(WAIT, || conn.is_running()));

    let (mut reconnected, _) = listener.accept().expect("accept rollback connection");
    reconnected.write_all(b"still here").expect("peer write");
    assert!(wait_until(WAIT, || recorder.data_count() == 1));

    conn.stop();
}

#[test]
fn failed_migration_without_rollback_errors() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder)
        .with_tunables(fast_tunables())
        .with_auto_start(false);
    let (conn, _peer) = connect_pair(ctx);
    assert!(!conn.is_running());

    // Not running means nothing was captured; the failure propagates.
    let result = conn.set_socket_address(None, Some(dead_addr()));
    assert!(result.is_err());
}

#[test]
fn datagram_rebind_preserves_running_state() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let conn = DatagramConnection::bind(&empty_config(), ctx, "127.0.0.1:0", None)
        .expect("bind datagram");
    assert!(wait_until(WAIT, || conn.is_running()));

    let new_local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    conn.set_socket_address(Some(new_local), None)
        .expect("rebind to a fresh port");
    let rebound = conn.local_addr().expect("rebound local addr");
    assert!(wait_until(WAIT, || conn.is_running()));

    // Packets reach the endpoint at its new address.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"relocated", rebound).expect("send");
    assert!(wait_until(WAIT, || recorder.data_count() == 1));

    conn.stop();
}
