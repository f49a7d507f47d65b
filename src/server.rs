//! Server lifecycle: bind, background accept loop, quiescence and stop.
//!
//! Each [`TestServer`] owns exactly one dedicated background thread that
//! accepts connections and handles them sequentially — one active
//! connection at a time, matching the single last-handler slot. Tests
//! drive the lifecycle through the [`ServerHandle`]: `wait_for_silence`
//! between cases, `stop` at teardown.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatch::dispatch;
use crate::error::{Error, Result};
use crate::handler::{HandlerFactory, SharedHandler};
use crate::report::{self, FailureChannel, FailureSink};
use crate::tls::TlsConfig;

/// Static server configuration (set at construction time).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Port 0 requests an OS-assigned ephemeral port.
    pub bind_address: SocketAddr,
    /// TLS directive: `None` serves plaintext and never attempts a
    /// handshake; `Some` upgrades every accepted connection.
    pub tls: Option<TlsConfig>,
    /// How often the accept loop re-checks the running flag while idle.
    pub accept_poll: Duration,
}

impl ServerConfig {
    /// Create a configuration binding `127.0.0.1:0` (ephemeral port).
    pub fn new() -> Self {
        Self {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            tls: None,
            accept_poll: Duration::from_millis(10),
        }
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Enable TLS with explicit handshake parameters.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Enable TLS with all defaults (the bundled self-signed identity).
    pub fn with_tls_defaults(self) -> Self {
        self.with_tls(TlsConfig::new())
    }

    /// Set the idle poll interval of the accept loop.
    pub fn with_accept_poll(mut self, poll: Duration) -> Self {
        self.accept_poll = poll;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the accept thread and the handle.
pub(crate) struct ServerShared {
    running: AtomicBool,
    active: Mutex<bool>,
    idle: Condvar,
    last_handler: Mutex<Option<SharedHandler>>,
}

impl ServerShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            active: Mutex::new(false),
            idle: Condvar::new(),
            last_handler: Mutex::new(None),
        }
    }

    pub(crate) fn set_active(&self, active: bool) {
        *self.active.lock().unwrap() = active;
        if !active {
            self.idle.notify_all();
        }
    }

    pub(crate) fn store_last_handler(&self, handler: SharedHandler) {
        *self.last_handler.lock().unwrap() = Some(handler);
    }

    fn wait_for_silence(&self) {
        let mut active = self.active.lock().unwrap();
        while *active {
            active = self.idle.wait(active).unwrap();
        }
    }
}

/// A bound test server, not yet accepting.
///
/// Created by [`TestServer::new`] (state CREATED); [`spawn`] moves it onto
/// its background thread (RUNNING) and returns the [`ServerHandle`].
///
/// [`spawn`]: TestServer::spawn
pub struct TestServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    factory: HandlerFactory,
    shared: Arc<ServerShared>,
    sink: FailureSink,
    failures: FailureChannel,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TestServer {
    /// Bind the listener and prepare the server.
    ///
    /// Bind or listen failure is fatal and never retried: tests request
    /// ephemeral ports, so collisions do not arise by design.
    pub fn new(config: ServerConfig, factory: HandlerFactory) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address).map_err(|source| Error::Bind {
            addr: config.bind_address,
            source,
        })?;
        listener.set_nonblocking(true).map_err(|source| Error::Bind {
            addr: config.bind_address,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: config.bind_address,
            source,
        })?;

        log::info!(
            "test server listening on {} ({})",
            local_addr,
            if config.tls.is_some() { "tls" } else { "plaintext" }
        );

        let (sink, failures) = report::channel();

        Ok(Self {
            listener,
            local_addr,
            config,
            factory,
            shared: Arc::new(ServerShared::new()),
            sink,
            failures,
        })
    }

    /// The resolved bound address (ephemeral port already assigned).
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The resolved bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Start the accept loop on a dedicated background thread and return
    /// the handle test code drives the server with.
    pub fn spawn(self) -> ServerHandle {
        let Self {
            listener,
            local_addr,
            config,
            factory,
            shared,
            sink,
            failures,
        } = self;

        let loop_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            accept_loop(listener, config, factory, loop_shared, sink);
        });

        ServerHandle {
            addr: local_addr,
            shared,
            failures,
            handle: Some(handle),
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    factory: HandlerFactory,
    shared: Arc<ServerShared>,
    sink: FailureSink,
) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("accepted connection from {}", peer);
                dispatch(stream, peer, config.tls.as_ref(), &factory, &shared, &sink);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                thread::sleep(config.accept_poll);
            }
            Err(err) => {
                log::error!("accept failed, shutting down: {}", err);
                break;
            }
        }
    }
    log::info!("test server stopped");
}

/// Handle for a running test server.
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    failures: FailureChannel,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The server's bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server's bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The failure channel carrying one report per failed connection.
    pub fn failures(&self) -> &FailureChannel {
        &self.failures
    }

    /// The most recently constructed connection handler, if any.
    ///
    /// Last-write-wins: with the harness's sequential connection model
    /// this is the handler of the latest connection. Call
    /// [`wait_for_silence`](Self::wait_for_silence) first so the handler
    /// has finished running before inspecting it.
    pub fn last_handler(&self) -> Option<SharedHandler> {
        self.shared.last_handler.lock().unwrap().clone()
    }

    /// Block until no connection is currently being handled.
    ///
    /// Used between test cases to prevent cross-test interference. A
    /// connection dispatched before this call is waited on, not missed.
    pub fn wait_for_silence(&self) {
        self.shared.wait_for_silence();
    }

    /// Stop accepting and block until the accept loop has exited,
    /// including any in-flight connection on that thread.
    ///
    /// Cooperative only: an in-progress handshake or handler call is
    /// waited out, never interrupted, and no timeout is enforced — a hung
    /// handler blocks teardown. Shutdown errors are logged, not raised.
    /// After this returns the listener is closed and new connection
    /// attempts are refused.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("server thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_factory, Connection, Handler};
    use std::any::Any;

    struct NoopHandler;

    impl Handler for NoopHandler {
        fn handle(&mut self, _conn: &mut Connection) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_ephemeral_port_resolves_nonzero() {
        let server = TestServer::new(ServerConfig::new(), handler_factory(|_| NoopHandler)).unwrap();
        assert_ne!(server.port(), 0);
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        // 192.0.2.0/24 (TEST-NET-1) is never assigned to a local interface.
        let config = ServerConfig::new().with_bind_address("192.0.2.1:0".parse().unwrap());
        let err = TestServer::new(config, handler_factory(|_| NoopHandler)).unwrap_err();
        assert_eq!(err.kind(), "bind");
    }
}
