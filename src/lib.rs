//! Short-lived TCP/TLS test servers with asynchronous failure reporting.
//!
//! This crate starts a real network server on a dedicated background
//! thread so test suites can exercise live socket and TLS behavior —
//! protocol downgrade rejection, client-certificate requests, SNI and
//! ALPN branching — without writing socket plumbing in every test.
//!
//! Each accepted connection is handed to a fresh [`Handler`] built by the
//! suite's [`HandlerFactory`]. Failures during the TLS handshake or
//! handler execution never crash the server; they are formatted into
//! [`FailureReport`]s and queued on a channel the test thread inspects at
//! its leisure. A single bad connection never terminates the server.
//!
//! # Getting Started
//!
//! ```no_run
//! use std::any::Any;
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! use testserver::{handler_factory, Connection, Handler, ServerConfig, TestServer};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn handle(&mut self, conn: &mut Connection) -> testserver::Result<()> {
//!         let mut buf = [0u8; 1024];
//!         let n = conn.read(&mut buf)?;
//!         conn.write_all(&buf[..n])?;
//!         Ok(())
//!     }
//!
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//! }
//!
//! // Plaintext server on an ephemeral port.
//! let server = TestServer::new(ServerConfig::new(), handler_factory(|_| Echo))?;
//! let mut handle = server.spawn();
//!
//! let mut client = TcpStream::connect(("127.0.0.1", handle.port()))?;
//! client.write_all(b"ping")?;
//! let mut buf = [0u8; 4];
//! client.read_exact(&mut buf)?;
//! assert_eq!(&buf, b"ping");
//!
//! handle.wait_for_silence();
//! assert!(handle.failures().drain().is_empty());
//! handle.stop();
//! # Ok::<(), testserver::Error>(())
//! ```
//!
//! # TLS
//!
//! Pass a [`TlsConfig`] to upgrade every accepted connection:
//!
//! ```no_run
//! use testserver::{HandshakeMethod, ServerConfig, TlsConfig};
//!
//! // Defaults: bundled self-signed localhost certificate.
//! let config = ServerConfig::new().with_tls_defaults();
//!
//! // Legacy-only negotiation, for downgrade-rejection tests.
//! let config = ServerConfig::new()
//!     .with_tls(TlsConfig::new().with_method(HandshakeMethod::LegacyOnly));
//! ```
//!
//! The certificate and key files are re-read on every handshake, so a
//! suite can rotate them between connections. All other handshake
//! parameters are fixed once the server starts.
//!
//! # Concurrency model
//!
//! One dedicated thread per server; connections are handled sequentially
//! on that thread. [`ServerHandle::wait_for_silence`] blocks until no
//! connection is being handled, and [`ServerHandle::stop`] waits out any
//! in-flight connection before returning. The failure channel is the only
//! structure shared across threads.

mod dispatch;

pub mod error;
pub mod handler;
pub mod report;
pub mod server;
pub mod tls;

pub use error::{Error, Result};
pub use handler::{handler_factory, Connection, Handler, HandlerFactory, SharedHandler};
pub use report::{FailureChannel, FailureReport};
pub use server::{ServerConfig, ServerHandle, TestServer};
pub use tls::{AlpnSelect, HandshakeMethod, SniSelect, SslOptions, TlsConfig};
