//! Per-connection dispatch: handler construction, optional TLS upgrade,
//! and failure isolation.

use std::any::Any;
use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::handler::{Connection, HandlerFactory, SharedHandler, Transport};
use crate::report::{FailureReport, FailureSink};
use crate::server::ServerShared;
use crate::tls::TlsConfig;

/// Clears the active-connection flag when dropped, so `wait_for_silence`
/// is released even if the dispatch unwinds.
struct ActiveGuard<'a>(&'a ServerShared);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_active(false);
    }
}

/// Handle one accepted connection on the server thread.
///
/// Any failure during handler construction, the TLS handshake or handler
/// execution is caught, formatted into a [`FailureReport`] and pushed to
/// the sink; the caller's accept loop continues regardless. The
/// active-connection flag guarding `wait_for_silence` is raised for the
/// whole duration of the dispatch.
pub(crate) fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsConfig>,
    factory: &HandlerFactory,
    shared: &ServerShared,
    sink: &FailureSink,
) {
    shared.set_active(true);
    let _active = ActiveGuard(shared);

    if let Err(err) = serve(stream, peer, tls, factory, shared) {
        log::warn!("connection from {} failed: {}", peer, err);
        sink.push(FailureReport::from_error(&err));
    } else {
        log::debug!("connection from {} handled", peer);
    }
}

fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsConfig>,
    factory: &HandlerFactory,
    shared: &ServerShared,
) -> Result<()> {
    // The factory is suite-provided code, so a panic in it gets the same
    // treatment as a panic in the handler.
    let handler: SharedHandler = panic::catch_unwind(AssertUnwindSafe(|| factory(peer)))
        .map(|h| Arc::new(Mutex::new(h)))
        .map_err(|payload| Error::HandlerPanic(panic_message(payload)))?;
    shared.store_last_handler(Arc::clone(&handler));

    stream.set_nonblocking(false)?;

    let transport = match tls {
        Some(tls) => Transport::Tls(tls.accept(stream)?),
        None => Transport::Plain(stream),
    };
    let mut conn = Connection::new(transport, peer);

    // A panicking handler must not take down the accept thread; the
    // connection is still finalized afterwards.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.lock().unwrap().handle(&mut conn)
    }));
    let finished = conn.finish();

    match outcome {
        Ok(result) => {
            result?;
            finished
        }
        Err(payload) => Err(Error::HandlerPanic(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
