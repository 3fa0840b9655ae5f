//! Worker lifecycle: start/stop semantics, self-stop from a callback,
//! terminated events, and inactivity timeout.

mod support;

use commlink::prelude::*;
use std::io::Write;
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{connect_pair, fast_tunables, wait_until, Recorder};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn stop_blocks_until_worker_exits() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let (conn, _peer) = connect_pair(ctx);

    assert!(wait_until(WAIT, || conn.is_running()));
    assert!(conn.is_started());

    // After stop() returns from another thread, the worker has fully drained.
    conn.stop();
    assert!(!conn.is_running());
    assert!(!conn.is_started());

    // A requested stop is a clean termination.
    assert_eq!(recorder.terminated_count(), 1);
    let terminated = recorder.terminated.lock().unwrap();
    assert_eq!(terminated[0].0, conn.id());
    assert!(terminated[0].1.is_none());
}

#[test]
fn start_and_stop_are_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let (conn, _peer) = connect_pair(ctx);

    assert!(wait_until(WAIT, || conn.is_running()));
    conn.start().expect("second start is a no-op");
    assert!(conn.is_running());

    conn.stop();
    conn.stop();
    assert!(!conn.is_running());
    assert_eq!(recorder.terminated_count(), 1);
}

// Stops its own connection from inside a data callback.
struct SelfStopper {
    conn: Mutex<Option<StreamConnection>>,
}

impl ConnectionListener for SelfStopper {
    fn on_data(&self, _event: &DataEvent<'_>) {
        if let Some(conn) = self.conn.lock().unwrap().as_ref() {
            conn.stop();
        }
    }
}

#[test]
fn listener_stopping_own_connection_does_not_deadlock() {
    let stopper = Arc::new(SelfStopper {
        conn: Mutex::new(None),
    });
    let ctx = ConnectionContext::new(stopper.clone()).with_tunables(fast_tunables());
    let (conn, mut peer) = connect_pair(ctx);
    *stopper.conn.lock().unwrap() = Some(conn.clone());

    assert!(wait_until(WAIT, || conn.is_running()));
    peer.write_all(b"shut it down").expect("peer write");

    // The stop skips the self-join, so the worker winds down after the
    // callback instead of deadlocking on itself.
    assert!(wait_until(WAIT, || !conn.is_running()));
    assert!(!conn.is_started());
}

#[test]
fn peer_close_fires_terminated_without_error() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(fast_tunables());
    let (conn, peer) = connect_pair(ctx);

    assert!(wait_until(WAIT, || conn.is_running()));
    peer.shutdown(Shutdown::Both).expect("peer shutdown");

    assert!(wait_until(WAIT, || recorder.terminated_count() == 1));
    assert!(wait_until(WAIT, || !conn.is_running()));
    let terminated = recorder.terminated.lock().unwrap();
    assert!(terminated[0].1.is_none(), "end of stream is not an error");
}

#[test]
fn silence_beyond_inactivity_window_terminates() {
    let recorder = Arc::new(Recorder::default());
    let mut tunables = fast_tunables();
    tunables.inactivity_timeout = Some(Duration::from_millis(200));
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(tunables);
    let (conn, _peer) = connect_pair(ctx);

    assert!(wait_until(WAIT, || recorder.terminated_count() == 1));
    assert!(wait_until(WAIT, || !conn.is_running()));
    let terminated = recorder.terminated.lock().unwrap();
    let err = terminated[0].1.as_ref().expect("inactivity is an error");
    assert!(err.contains("Inactivity"), "unexpected error: {err}");
}

#[test]
fn data_resets_the_inactivity_window() {
    let recorder = Arc::new(Recorder::default());
    let mut tunables = fast_tunables();
    tunables.inactivity_timeout = Some(Duration::from_millis(400));
    let ctx = ConnectionContext::new(recorder.clone()).with_tunables(tunables);
    let (conn, mut peer) = connect_pair(ctx);

    // Keep feeding data more often than the window; the connection must
    // outlive several windows' worth of wall time.
    for _ in 0..6 {
        peer.write_all(b"keepalive").expect("peer write");
        std::thread::sleep(Duration::from_millis(150));
    }
    assert!(conn.is_running(), "activity should hold the connection open");

    conn.stop();
}

#[test]
fn send_after_stop_reports_not_connected() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ConnectionContext::new(recorder).with_tunables(fast_tunables());
    let (conn, _peer) = connect_pair(ctx);

    conn.send(b"hello").expect("send while connected");
    conn.stop();
    assert!(matches!(conn.send(b"hello"), Err(Error::NotConnected)));
}
