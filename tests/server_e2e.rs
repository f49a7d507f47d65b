//! End-to-end tests for the server lifecycle: plaintext handling, failure
//! isolation, quiescence, stop semantics and last-handler introspection.

use std::any::Any;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use testserver::{
    handler_factory, Connection, Error, Handler, ServerConfig, ServerHandle, TestServer,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const REPORT_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to test server");
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

// =============================================================================
// Test Handlers
// =============================================================================

/// Echoes one read back to the client and counts the bytes it saw.
struct EchoHandler {
    bytes_seen: usize,
}

impl Handler for EchoHandler {
    fn handle(&mut self, conn: &mut Connection) -> testserver::Result<()> {
        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf)?;
        self.bytes_seen = n;
        conn.write_all(&buf[..n])?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn echo_server() -> ServerHandle {
    TestServer::new(ServerConfig::new(), handler_factory(|_| EchoHandler { bytes_seen: 0 }))
        .expect("bind echo server")
        .spawn()
}

// =============================================================================
// Plaintext Handling
// =============================================================================

#[test]
fn test_plaintext_echo_roundtrip() {
    init_logging();
    let mut handle = echo_server();

    let mut client = connect(handle.port());
    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    handle.wait_for_silence();
    assert!(handle.failures().drain().is_empty());
    handle.stop();
}

#[test]
fn test_sequential_connections_on_one_server() {
    init_logging();
    let mut handle = echo_server();

    for msg in [b"one".as_slice(), b"two", b"three"] {
        let mut client = connect(handle.port());
        client.write_all(msg).unwrap();
        let mut buf = vec![0u8; msg.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg);
    }

    handle.wait_for_silence();
    assert!(handle.failures().drain().is_empty());
    handle.stop();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_ephemeral_ports_are_independent() {
    init_logging();
    let mut first = echo_server();
    let mut second = echo_server();

    assert_ne!(first.port(), 0);
    assert_ne!(second.port(), 0);
    assert_ne!(first.port(), second.port());

    first.stop();
    second.stop();
}

#[test]
fn test_stop_refuses_new_connections() {
    init_logging();
    let mut handle = echo_server();
    let port = handle.port();

    // Server is live before the stop.
    drop(connect(port));
    handle.wait_for_silence();
    handle.stop();

    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}

#[test]
fn test_wait_for_silence_waits_for_active_connection() {
    init_logging();

    let started = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    struct SlowHandler {
        started: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    }

    impl Handler for SlowHandler {
        fn handle(&mut self, conn: &mut Connection) -> testserver::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte)?;
            thread::sleep(Duration::from_millis(200));
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let factory = {
        let started = Arc::clone(&started);
        let done = Arc::clone(&done);
        handler_factory(move |_| SlowHandler {
            started: Arc::clone(&started),
            done: Arc::clone(&done),
        })
    };
    let mut handle = TestServer::new(ServerConfig::new(), factory)
        .expect("bind slow server")
        .spawn();

    let mut client = connect(handle.port());

    // Wait until the connection is being handled.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "handler never started");
        thread::sleep(Duration::from_millis(5));
    }

    client.write_all(&[0x2a]).unwrap();
    handle.wait_for_silence();
    assert!(
        done.load(Ordering::SeqCst),
        "wait_for_silence returned while the handler was still running"
    );

    handle.stop();
}

// =============================================================================
// Failure Isolation
// =============================================================================

#[test]
fn test_failing_handler_produces_exactly_one_report() {
    init_logging();

    struct FailingHandler;

    impl Handler for FailingHandler {
        fn handle(&mut self, _conn: &mut Connection) -> testserver::Result<()> {
            Err(Error::msg("boom"))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let mut handle = TestServer::new(ServerConfig::new(), handler_factory(|_| FailingHandler))
        .expect("bind failing server")
        .spawn();

    drop(connect(handle.port()));

    let report = handle
        .failures()
        .pop_timeout(REPORT_TIMEOUT)
        .expect("one failure report");
    assert_eq!(report.kind, "handler");
    assert!(report.message.contains("boom"), "message: {}", report.message);

    handle.wait_for_silence();
    assert!(handle.failures().try_pop().is_none(), "exactly one report expected");
    handle.stop();
}

#[test]
fn test_panicking_handler_does_not_kill_server() {
    init_logging();

    let connections = Arc::new(AtomicUsize::new(0));

    struct FlakyHandler {
        should_panic: bool,
    }

    impl Handler for FlakyHandler {
        fn handle(&mut self, conn: &mut Connection) -> testserver::Result<()> {
            if self.should_panic {
                panic!("kaboom");
            }
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf)?;
            conn.write_all(&buf[..n])?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let factory = {
        let connections = Arc::clone(&connections);
        handler_factory(move |_| FlakyHandler {
            should_panic: connections.fetch_add(1, Ordering::SeqCst) == 0,
        })
    };
    let mut handle = TestServer::new(ServerConfig::new(), factory)
        .expect("bind flaky server")
        .spawn();

    // First connection panics the handler.
    drop(connect(handle.port()));
    let report = handle
        .failures()
        .pop_timeout(REPORT_TIMEOUT)
        .expect("panic report");
    assert_eq!(report.kind, "panic");
    assert!(report.message.contains("kaboom"), "message: {}", report.message);

    // The server survives and handles the next connection normally.
    let mut client = connect(handle.port());
    client.write_all(b"alive").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"alive");

    handle.wait_for_silence();
    assert!(handle.failures().try_pop().is_none());
    handle.stop();
}

#[test]
fn test_panicking_factory_does_not_kill_server() {
    init_logging();

    let connections = Arc::new(AtomicUsize::new(0));

    let factory = {
        let connections = Arc::clone(&connections);
        handler_factory(move |_| {
            if connections.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("factory kaboom");
            }
            EchoHandler { bytes_seen: 0 }
        })
    };
    let mut handle = TestServer::new(ServerConfig::new(), factory)
        .expect("bind server")
        .spawn();

    // First connection panics during handler construction.
    drop(connect(handle.port()));
    let report = handle
        .failures()
        .pop_timeout(REPORT_TIMEOUT)
        .expect("construction panic report");
    assert_eq!(report.kind, "panic");
    assert!(
        report.message.contains("factory kaboom"),
        "message: {}",
        report.message
    );

    // The accept thread survives and quiescence is not wedged.
    handle.wait_for_silence();
    let mut client = connect(handle.port());
    client.write_all(b"alive").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"alive");

    handle.wait_for_silence();
    assert!(handle.failures().try_pop().is_none());
    handle.stop();
}

#[test]
fn test_reports_preserve_failure_order() {
    init_logging();

    let connections = Arc::new(AtomicUsize::new(0));

    struct NumberedFailure {
        n: usize,
    }

    impl Handler for NumberedFailure {
        fn handle(&mut self, _conn: &mut Connection) -> testserver::Result<()> {
            Err(Error::msg(format!("failure {}", self.n)))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let factory = {
        let connections = Arc::clone(&connections);
        handler_factory(move |_| NumberedFailure {
            n: connections.fetch_add(1, Ordering::SeqCst),
        })
    };
    let mut handle = TestServer::new(ServerConfig::new(), factory)
        .expect("bind server")
        .spawn();

    drop(connect(handle.port()));
    let first = handle.failures().pop_timeout(REPORT_TIMEOUT).unwrap();
    drop(connect(handle.port()));
    let second = handle.failures().pop_timeout(REPORT_TIMEOUT).unwrap();

    assert!(first.message.contains("failure 0"));
    assert!(second.message.contains("failure 1"));

    handle.wait_for_silence();
    handle.stop();
}

// =============================================================================
// Last-Handler Introspection
// =============================================================================

#[test]
fn test_last_handler_slot_holds_final_state() {
    init_logging();
    let mut handle = echo_server();

    let mut first = connect(handle.port());
    first.write_all(b"abc").unwrap();
    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).unwrap();

    let mut second = connect(handle.port());
    second.write_all(b"1234567").unwrap();
    let mut buf = [0u8; 7];
    second.read_exact(&mut buf).unwrap();

    handle.wait_for_silence();

    let shared = handle.last_handler().expect("a handler was constructed");
    let guard = shared.lock().unwrap();
    let echo = guard
        .as_any()
        .downcast_ref::<EchoHandler>()
        .expect("last handler is an EchoHandler");
    assert_eq!(echo.bytes_seen, 7, "slot holds the most recent handler");

    drop(guard);
    handle.stop();
}
