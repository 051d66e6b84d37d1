//! Per-call deadline and cancellation.
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, at, bounded, never};

use crate::error::Error;

/// Bounds how long a call may wait and lets another thread abandon it.
///
/// A context without a deadline or cancel handle waits forever. Contexts are cheap to clone; every
/// clone observes the same cancellation.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Receiver<()>,
}

/// Cancels the [`CallContext`] it was created with.
///
/// Dropping the handle also cancels the context, so keep it alive for as long as the call should
/// be allowed to run.
#[derive(Debug)]
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {}
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: never(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Tightens the deadline to `timeout` from now; an earlier deadline is kept.
    pub fn timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.deadline(deadline),
            None => self,
        }
    }

    /// Tightens the deadline; an earlier deadline is kept.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Replaces the cancellation source with a fresh one controlled by the returned handle.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = bounded(0);
        self.cancel = rx;
        (self, CancelHandle { _tx: tx })
    }

    pub fn get_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The reason this context can no longer be waited on, if any.
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Some(Error::Timeout),
            _ => None,
        }
    }

    /// Fires once cancelled; use in `select!`.
    pub(crate) fn cancelled(&self) -> &Receiver<()> {
        &self.cancel
    }

    /// Fires at the deadline; use in `select!`.
    pub(crate) fn expired(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }
}
