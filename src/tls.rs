//! Server-side TLS configuration and handshake.
//!
//! A [`TlsConfig`] describes every handshake parameter a test can vary:
//! certificate and key paths, the protocol negotiation method, an extra
//! protocol option mask, the cipher list, Diffie-Hellman parameters, an
//! additional chain file, SNI and ALPN selection callbacks, and whether a
//! client certificate is requested.
//!
//! Certificate and key material is re-read from disk and re-parsed on
//! every handshake, so a test suite can rotate the files between
//! connections without restarting the server. Everything else is fixed
//! once the server starts (the server owns a clone of the config).

use std::fmt;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::dh::Dh;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    NameType, SniError, Ssl, SslAlert, SslContext, SslContextBuilder, SslMethod, SslRef,
    SslStream, SslVerifyMode,
};
use openssl::x509::X509;

pub use openssl::ssl::{AlpnError, SslOptions};

use crate::error::{Error, Result};

/// Certificate selection callback invoked with the SNI hostname the client
/// sent during negotiation. Returning `Some((cert, key))` substitutes the
/// connection's certificate with the identity at those paths.
pub type SniSelect = Arc<dyn Fn(&str) -> Option<(PathBuf, PathBuf)> + Send + Sync>;

/// Application protocol selection callback invoked with the protocols the
/// client offered, in the client's preference order. The returned protocol
/// must be one of the offered ones; `None` declines ALPN negotiation.
pub type AlpnSelect = Arc<dyn Fn(&[Vec<u8>]) -> Option<Vec<u8>> + Send + Sync>;

/// How the server negotiates the TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeMethod {
    /// Negotiate the best protocol version both sides support.
    #[default]
    NegotiateBest,
    /// Offer only legacy protocol versions by disabling TLS 1.2 and
    /// TLS 1.3 in the option mask. A client that requires a modern
    /// protocol version deterministically fails the handshake, which is
    /// what downgrade-rejection tests rely on.
    LegacyOnly,
}

/// Handshake parameters for a TLS-enabled test server.
#[derive(Clone)]
pub struct TlsConfig {
    /// PEM certificate path, re-read on every handshake.
    pub cert: PathBuf,
    /// PEM private key path, re-read on every handshake.
    pub key: PathBuf,
    /// Protocol version negotiation mode.
    pub method: HandshakeMethod,
    /// Additional protocol options OR-ed into the context option mask.
    pub extra_options: SslOptions,
    /// Request (but do not require) a client certificate during the
    /// handshake. Any presented certificate is accepted and made available
    /// to the handler via [`Connection::peer_certificate`].
    ///
    /// [`Connection::peer_certificate`]: crate::Connection::peer_certificate
    pub request_client_cert: bool,
    /// OpenSSL cipher list string, if any.
    pub cipher_list: Option<String>,
    /// PEM Diffie-Hellman parameters for ephemeral DH key exchange.
    pub dhparams: Option<PathBuf>,
    /// Extra certificate chain file (PEM, may contain multiple certs).
    pub chain_file: Option<PathBuf>,
    sni_select: Option<SniSelect>,
    alpn_select: Option<AlpnSelect>,
}

impl TlsConfig {
    /// Create a config using the bundled self-signed localhost identity.
    pub fn new() -> Self {
        Self {
            cert: bundled("server.crt"),
            key: bundled("server.key"),
            method: HandshakeMethod::default(),
            extra_options: SslOptions::empty(),
            request_client_cert: false,
            cipher_list: None,
            dhparams: None,
            chain_file: None,
            sni_select: None,
            alpn_select: None,
        }
    }

    /// Set the certificate and key paths.
    pub fn with_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert = cert.into();
        self.key = key.into();
        self
    }

    /// Set the protocol negotiation method.
    pub fn with_method(mut self, method: HandshakeMethod) -> Self {
        self.method = method;
        self
    }

    /// OR additional protocol options into the context option mask.
    pub fn with_options(mut self, options: SslOptions) -> Self {
        self.extra_options |= options;
        self
    }

    /// Request a client certificate during the handshake.
    pub fn with_request_client_cert(mut self) -> Self {
        self.request_client_cert = true;
        self
    }

    /// Set the OpenSSL cipher list string.
    pub fn with_cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set the PEM Diffie-Hellman parameter file.
    pub fn with_dhparams(mut self, path: impl Into<PathBuf>) -> Self {
        self.dhparams = Some(path.into());
        self
    }

    /// Set an extra certificate chain file.
    pub fn with_chain_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.chain_file = Some(path.into());
        self
    }

    /// Set the SNI certificate-selection callback.
    pub fn with_sni_select<F>(mut self, select: F) -> Self
    where
        F: Fn(&str) -> Option<(PathBuf, PathBuf)> + Send + Sync + 'static,
    {
        self.sni_select = Some(Arc::new(select));
        self
    }

    /// Set the ALPN protocol-selection callback.
    pub fn with_alpn_select<F>(mut self, select: F) -> Self
    where
        F: Fn(&[Vec<u8>]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.alpn_select = Some(Arc::new(select));
        self
    }

    /// Perform the server-side handshake on an accepted stream.
    ///
    /// Builds a fresh context for this connection (certificate and key are
    /// parsed from disk here, once per handshake) and negotiates TLS.
    pub fn accept(&self, stream: TcpStream) -> Result<SslStream<TcpStream>> {
        let ctx = self.build_context()?;
        let ssl = Ssl::new(&ctx)?;
        ssl.accept(stream)
            .map_err(|err| Error::Handshake(err.to_string()))
    }

    fn build_context(&self) -> Result<SslContext> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;

        let (cert, key) = load_identity(&self.cert, &self.key)?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder.check_private_key()?;

        let mut options = self.extra_options;
        if self.method == HandshakeMethod::LegacyOnly {
            options |= SslOptions::NO_TLSV1_3 | SslOptions::NO_TLSV1_2;
        }
        builder.set_options(options);

        if let Some(ciphers) = &self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }

        if let Some(path) = &self.dhparams {
            let pem = read_pem(path, "dh parameters")?;
            let dh = Dh::params_from_pem(&pem)?;
            builder.set_tmp_dh(&dh)?;
        }

        if let Some(path) = &self.chain_file {
            let pem = read_pem(path, "certificate chain")?;
            for extra in X509::stack_from_pem(&pem)? {
                builder.add_extra_chain_cert(extra)?;
            }
        }

        if self.request_client_cert {
            // PEER without FAIL_IF_NO_PEER_CERT: the certificate is
            // requested, accepted unverified, and exposed to the handler.
            builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
        }

        if let Some(select) = &self.sni_select {
            install_sni_callback(&mut builder, Arc::clone(select));
        }

        if let Some(select) = &self.alpn_select {
            install_alpn_callback(&mut builder, Arc::clone(select));
        }

        Ok(builder.build())
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("cert", &self.cert)
            .field("key", &self.key)
            .field("method", &self.method)
            .field("extra_options", &self.extra_options)
            .field("request_client_cert", &self.request_client_cert)
            .field("cipher_list", &self.cipher_list)
            .field("dhparams", &self.dhparams)
            .field("chain_file", &self.chain_file)
            .field("sni_select", &self.sni_select.is_some())
            .field("alpn_select", &self.alpn_select.is_some())
            .finish()
    }
}

/// Path of a bundled data file (the default self-signed identity).
pub fn bundled(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("data").join(name)
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|err| Error::InvalidConfig(format!("unreadable {} {}: {}", what, path.display(), err)))
}

fn load_identity(cert: &Path, key: &Path) -> Result<(X509, PKey<Private>)> {
    let cert = X509::from_pem(&read_pem(cert, "certificate")?)?;
    let key = PKey::private_key_from_pem(&read_pem(key, "private key")?)?;
    Ok((cert, key))
}

/// Build a minimal context holding only an identity, used when the SNI
/// callback substitutes the certificate for a hostname.
fn context_for_identity(cert: &Path, key: &Path) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    let (cert, key) = load_identity(cert, key)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;
    Ok(builder.build())
}

fn install_sni_callback(builder: &mut SslContextBuilder, select: SniSelect) {
    builder.set_servername_callback(move |ssl: &mut SslRef, _alert: &mut SslAlert| {
        let name = match ssl.servername(NameType::HOST_NAME) {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };
        let (cert, key) = match select(&name) {
            Some(identity) => identity,
            None => return Ok(()),
        };
        let ctx = context_for_identity(&cert, &key).map_err(|err| {
            log::warn!("sni substitution for {:?} failed: {}", name, err);
            SniError::ALERT_FATAL
        })?;
        ssl.set_ssl_context(&ctx).map_err(|err| {
            log::warn!("sni context switch for {:?} failed: {}", name, err);
            SniError::ALERT_FATAL
        })?;
        Ok(())
    });
}

fn install_alpn_callback(builder: &mut SslContextBuilder, select: AlpnSelect) {
    builder.set_alpn_select_callback(move |_ssl: &mut SslRef, client: &[u8]| {
        let offered = parse_alpn_wire(client);
        let choice = select(&offered).ok_or(AlpnError::NOACK)?;
        // The callback must return a subslice of the client's wire buffer.
        find_offered(client, &choice).ok_or(AlpnError::NOACK)
    });
}

/// Decode the ALPN wire format (length-prefixed protocol names) into a
/// list of protocols. Truncated entries are dropped.
fn parse_alpn_wire(buf: &[u8]) -> Vec<Vec<u8>> {
    let mut protocols = Vec::new();
    let mut rest = buf;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            break;
        }
        protocols.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    protocols
}

/// Locate `choice` among the wire-format entries of `buf` and return the
/// matching subslice.
fn find_offered<'a>(buf: &'a [u8], choice: &[u8]) -> Option<&'a [u8]> {
    let mut rest = buf;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            break;
        }
        if &tail[..len] == choice {
            return Some(&tail[..len]);
        }
        rest = &tail[len..];
    }
    None
}
