//! Crate-level error types.

use std::io;
use std::net::SocketAddr;

/// Crate-level error type.
///
/// Setup-fatal errors (`Bind`, unreadable certificate or key material)
/// surface synchronously from [`TestServer::new`](crate::TestServer::new).
/// Everything that happens while handling a connection is caught on the
/// server thread and delivered as a [`FailureReport`](crate::FailureReport)
/// instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Binding or listening on the requested address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Certificate/key loading or TLS context construction failed.
    #[error("tls setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    /// The server-side TLS handshake with a client failed.
    #[error("tls handshake failed: {0}")]
    Handshake(String),

    /// Socket I/O failed while handling a connection.
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),

    /// The harness configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A connection handler panicked.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// A simple error message, for handler implementations.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Stable short name for the error category.
    ///
    /// Used as the `kind` field of failure reports so tests can assert on
    /// the failure class without string-matching the full message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Tls(_) => "tls",
            Self::Handshake(_) => "handshake",
            Self::Io(_) => "io",
            Self::InvalidConfig(_) => "config",
            Self::HandlerPanic(_) => "panic",
            Self::Message(_) => "handler",
        }
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
