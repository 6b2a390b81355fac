//! Asynchronous request handles.
//!
//! Submitting a read or write transfers ownership of the buffer to the
//! device worker; [`Request::wait`] blocks until the transfer finished and
//! hands the buffer back. Cancellation is advisory: it only takes effect if
//! the worker has not started the operation yet, in which case the buffer
//! comes back untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::io::stats::{IoStats, WaitKind};
use crate::storage::RawBuf;

pub(crate) enum ReqState {
    Pending,
    Done(Result<RawBuf>),
    Taken,
}

pub(crate) struct ReqShared {
    pub(crate) state: Mutex<ReqState>,
    pub(crate) cv: Condvar,
    pub(crate) cancel: AtomicBool,
    /// True when the worker skipped the transfer due to cancellation.
    pub(crate) skipped: AtomicBool,
}

impl ReqShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReqState::Pending),
            cv: Condvar::new(),
            cancel: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
        })
    }

    pub(crate) fn complete(&self, result: Result<RawBuf>) {
        let mut state = self.state.lock();
        *state = ReqState::Done(result);
        self.cv.notify_all();
    }
}

/// Handle to one in-flight block transfer.
pub struct Request {
    shared: Arc<ReqShared>,
    kind: WaitKind,
    stats: Arc<IoStats>,
}

impl Request {
    pub(crate) fn new(shared: Arc<ReqShared>, kind: WaitKind, stats: Arc<IoStats>) -> Self {
        Self {
            shared,
            kind,
            stats,
        }
    }

    /// Produce an already-failed request (e.g. submission after shutdown).
    pub(crate) fn failed(err: crate::error::ExtError, kind: WaitKind, stats: Arc<IoStats>) -> Self {
        let shared = ReqShared::new();
        shared.complete(Err(err));
        Self::new(shared, kind, stats)
    }

    /// Block until the transfer finished; yields the buffer back on success.
    pub fn wait(self) -> Result<RawBuf> {
        self.wait_detailed().map(|(buf, _)| buf)
    }

    /// Like [`wait`](Request::wait), additionally reporting whether the
    /// transfer was skipped due to cancellation (the buffer is then
    /// untouched).
    pub fn wait_detailed(self) -> Result<(RawBuf, bool)> {
        let begin = Instant::now();
        let mut state = self.shared.state.lock();
        while matches!(*state, ReqState::Pending) {
            self.shared.cv.wait(&mut state);
        }
        self.stats.waited(self.kind, begin.elapsed());
        let result = match std::mem::replace(&mut *state, ReqState::Taken) {
            ReqState::Done(result) => result,
            _ => unreachable!("request waited on twice"),
        };
        let skipped = self.shared.skipped.load(Ordering::Acquire);
        result.map(|buf| (buf, skipped))
    }

    /// Whether the transfer has completed (successfully or not).
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), ReqState::Pending)
    }

    /// Ask the worker to skip the transfer if it has not started yet.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }
}
