//! Synchronization primitives used by the fetch cycle.
//!
//! - [`CancelScope`]: a per-cycle cancellation token, optionally linked to a
//!   caller-supplied token so that either source cancels the cycle.
//! - [`ResumeSignal`]: a single-permit signal a paused retry blocks on until
//!   reachability comes back.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation scope owned by one fetch cycle.
#[derive(Debug)]
pub(crate) struct CancelScope {
    token: CancellationToken,
    external: Option<CancellationToken>,
    link: Option<JoinHandle<()>>,
}

impl CancelScope {
    /// Creates a scope cancelled with `parent`, and with `external` when given.
    ///
    /// An `external` token that is already cancelled cancels the scope up front.
    pub(crate) fn linked(
        parent: &CancellationToken,
        external: Option<CancellationToken>,
    ) -> Self {
        let token = parent.child_token();
        if external.as_ref().is_some_and(CancellationToken::is_cancelled) {
            token.cancel();
        }
        let link = external
            .clone()
            .filter(|_| !token.is_cancelled())
            .map(|external| {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = external.cancelled() => token.cancel(),
                        () = token.cancelled() => {}
                    }
                })
            });
        Self {
            token,
            external,
            link,
        }
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Also observes the external token directly, so a cancellation the
    /// forwarding task has not yet seen still counts.
    pub(crate) fn is_cancelled(&self) -> bool {
        if self
            .external
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            self.token.cancel();
        }
        self.token.is_cancelled()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.abort();
        }
    }
}

/// Returned by [`Waiter::wait`] when the signal was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterDisposed;

#[derive(Debug, Default)]
struct SignalState {
    waiters: usize,
    permit: bool,
    disposed: bool,
}

/// Single-permit signal: one `release` wakes exactly one registered waiter.
///
/// Releases without a registered waiter are dropped, so a stale release can
/// never let a later pause through.
#[derive(Debug, Default)]
pub(crate) struct ResumeSignal {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl ResumeSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter immediately. Dropping it deregisters.
    pub(crate) fn waiter(&self) -> Waiter<'_> {
        self.lock().waiters += 1;
        Waiter { signal: self }
    }

    #[cfg(test)]
    fn has_waiter(&self) -> bool {
        self.lock().waiters > 0
    }

    /// Releases one waiter. Returns `false` if nobody was waiting.
    pub(crate) fn release(&self) -> bool {
        {
            let mut state = self.lock();
            if state.disposed || state.waiters == 0 || state.permit {
                return false;
            }
            state.permit = true;
        }
        self.notify.notify_waiters();
        true
    }

    /// Wakes every waiter with [`WaiterDisposed`]. Idempotent.
    pub(crate) fn dispose(&self) {
        self.lock().disposed = true;
        self.notify.notify_waiters();
    }
}

/// A registered waiter on a [`ResumeSignal`].
#[derive(Debug)]
pub(crate) struct Waiter<'a> {
    signal: &'a ResumeSignal,
}

impl Waiter<'_> {
    /// Blocks until released or disposed.
    pub(crate) async fn wait(&self) -> Result<(), WaiterDisposed> {
        loop {
            let notified = self.signal.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a release in between is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.signal.lock();
                if state.disposed {
                    return Err(WaiterDisposed);
                }
                if state.permit {
                    state.permit = false;
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut state = self.signal.lock();
        state.waiters = state.waiters.saturating_sub(1);
        if state.waiters == 0 {
            state.permit = false;
        }
    }
}
