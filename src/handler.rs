//! Connection handler trait and per-connection transport.
//!
//! A [`Handler`] processes exactly one accepted connection. The server
//! constructs a fresh handler for every connection through a
//! [`HandlerFactory`]; per-server handler configuration is captured by the
//! factory closure, so two servers with different handler behavior never
//! share state.
//!
//! The most recently constructed handler is kept in the server's
//! last-handler slot (see [`ServerHandle::last_handler`]) so tests can
//! inspect its final state after the connection completed. The slot is
//! last-write-wins and is only meaningful under the harness's sequential
//! connection model.
//!
//! [`ServerHandle::last_handler`]: crate::ServerHandle::last_handler

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use openssl::ssl::{NameType, SslStream};
use openssl::x509::X509;

use crate::error::Result;

/// The stream a connection runs over: raw TCP, or TCP upgraded to TLS.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// One accepted connection, as seen by a [`Handler`].
///
/// Implements [`Read`] and [`Write`] directly, so handlers treat plaintext
/// and TLS connections uniformly.
pub struct Connection {
    transport: Transport,
    peer: SocketAddr,
}

impl Connection {
    pub(crate) fn new(transport: Transport, peer: SocketAddr) -> Self {
        Self { transport, peer }
    }

    /// Address of the connected client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether this connection was upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// The certificate the client presented during the handshake, if the
    /// server requested one and the client sent it.
    pub fn peer_certificate(&self) -> Option<X509> {
        match &self.transport {
            Transport::Tls(stream) => stream.ssl().peer_certificate(),
            Transport::Plain(_) => None,
        }
    }

    /// The SNI hostname the client sent during the handshake, if any.
    pub fn sni_hostname(&self) -> Option<String> {
        match &self.transport {
            Transport::Tls(stream) => stream
                .ssl()
                .servername(NameType::HOST_NAME)
                .map(str::to_string),
            Transport::Plain(_) => None,
        }
    }

    /// The ALPN protocol negotiated during the handshake, if any.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.transport {
            Transport::Tls(stream) => stream
                .ssl()
                .selected_alpn_protocol()
                .map(<[u8]>::to_vec),
            Transport::Plain(_) => None,
        }
    }

    /// Flush and close the connection. Shutdown errors are swallowed; the
    /// dispatcher calls this for every connection, success or failure.
    pub(crate) fn finish(&mut self) -> Result<()> {
        let flushed = self.transport.flush();
        match &mut self.transport {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Tls(stream) => {
                let _ = stream.shutdown();
                let _ = stream.get_ref().shutdown(Shutdown::Both);
            }
        }
        flushed.map_err(Into::into)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }
}

/// Processes one accepted connection.
pub trait Handler: Send + 'static {
    /// Handle the connection. Returning an error (or panicking) produces
    /// one failure report; the server keeps accepting either way.
    fn handle(&mut self, conn: &mut Connection) -> Result<()>;

    /// Downcast support for last-handler introspection in tests.
    fn as_any(&self) -> &dyn Any;
}

/// Constructs one handler per accepted connection, bound to the peer
/// address.
pub type HandlerFactory = Arc<dyn Fn(SocketAddr) -> Box<dyn Handler> + Send + Sync>;

/// A handler as stored in the server's last-handler slot.
pub type SharedHandler = Arc<Mutex<Box<dyn Handler>>>;

/// Wrap a plain constructor closure into a [`HandlerFactory`].
pub fn handler_factory<H, F>(f: F) -> HandlerFactory
where
    H: Handler,
    F: Fn(SocketAddr) -> H + Send + Sync + 'static,
{
    Arc::new(move |peer| Box::new(f(peer)) as Box<dyn Handler>)
}
