//! Asynchronous failure reporting between the server thread and the test
//! thread.
//!
//! Each failed connection-handling attempt produces exactly one
//! [`FailureReport`], pushed from the server thread into an unbounded FIFO
//! channel. The test thread polls or drains the channel at any point,
//! typically at teardown, to assert either "no failures occurred" or
//! "exactly the expected failure occurred".
//!
//! The channel is never cleared automatically: records from a previous test
//! case remain visible until explicitly drained, so tests asserting on the
//! channel should drain before and after the action under test.

use std::error::Error as StdError;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Error;

/// A formatted record of one failed connection-handling attempt.
///
/// Carries the failure category, the top-level message, and the chain of
/// underlying causes (most specific first).
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl FailureReport {
    pub(crate) fn from_error(err: &Error) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace,
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for cause in &self.trace {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

/// Producer end of the failure channel, cloned into the server thread.
#[derive(Clone)]
pub(crate) struct FailureSink {
    tx: Sender<FailureReport>,
}

impl FailureSink {
    /// Push a report. A missing consumer is not an error: the server must
    /// keep accepting connections even after the handle was dropped.
    pub(crate) fn push(&self, report: FailureReport) {
        let _ = self.tx.send(report);
    }
}

/// Consumer end of the failure channel, exposed on the server handle.
///
/// Unbounded and FIFO: reports arrive in the order the failures occurred.
/// The receiver sits behind a mutex so the handle can be shared between
/// test threads.
pub struct FailureChannel {
    rx: Mutex<Receiver<FailureReport>>,
}

impl FailureChannel {
    /// Pop the oldest report without blocking.
    pub fn try_pop(&self) -> Option<FailureReport> {
        self.rx.lock().unwrap().try_recv().ok()
    }

    /// Pop the oldest report, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FailureReport> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    /// Remove and return every report currently queued.
    pub fn drain(&self) -> Vec<FailureReport> {
        let rx = self.rx.lock().unwrap();
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }
}

/// Create a connected sink/channel pair.
pub(crate) fn channel() -> (FailureSink, FailureChannel) {
    let (tx, rx) = mpsc::channel();
    (FailureSink { tx }, FailureChannel { rx: Mutex::new(rx) })
}
