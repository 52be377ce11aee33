use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CancelReason {
    /// The scheduler entry was removed, normally by `Recover`.
    Removed,
    /// The run outlived its `duration` bound.
    DeadlineExceeded,
    /// The engine is shutting down.
    Shutdown,
}

#[derive(Debug, Default)]
struct Inner {
    reason: Mutex<Option<CancelReason>>,
    signal: Condvar,
}

/// Cooperative cancellation signal shared between a run and its handler.
///
/// The first recorded reason wins; later calls to [`Cancellation::cancel`]
/// only wake waiters.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let mut current = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(reason);
        }
        self.inner.signal.notify_all();
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Blocks for up to `timeout`; returns `true` if cancelled meanwhile.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while current.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            current = self
                .inner
                .signal
                .wait_timeout(current, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
