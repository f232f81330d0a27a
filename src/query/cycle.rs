//! One fetch cycle: the single-flight lock, the attempt loop with retries and
//! the pause/resume handshake with reachability.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

use super::cache::CacheEntry;
use super::client::downcast_entry;
use super::instance::Inner;
use super::options::QueryContext;
use super::signal::CancelScope;
use super::state::FetchStatus;

/// What requested a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleKind {
    /// Fresh cached data short-circuits the cycle.
    Fetch,
    /// An explicit refetch call.
    Refetch,
    /// Stale timer or polling while data is displayed.
    Background,
}

impl CycleKind {
    /// Refetches bypass freshness and keep the previous failure count.
    const fn is_refetch(self) -> bool {
        !matches!(self, Self::Fetch)
    }
}

/// Cycle-local state threaded through the attempt loop.
#[derive(Debug)]
struct Cycle {
    kind: CycleKind,
    background: bool,
    /// `None` until the first failure, then the index of the latest retry decision.
    attempt_index: Option<u32>,
}

impl Cycle {
    const fn is_refetch(&self) -> bool {
        self.kind.is_refetch() || self.background
    }
}

/// Final step of every cycle, run on every exit path before the lock is released.
struct CycleGuard<'a, V: Clone + Send + Sync + 'static> {
    inner: &'a Arc<Inner<V>>,
    counted: bool,
    paused: Option<CycleKind>,
}

impl<V: Clone + Send + Sync + 'static> Drop for CycleGuard<'_, V> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.clear_active();
        let resume = inner.with_state(|state| {
            state.result.is_fetching_background = false;
            match self.paused {
                Some(kind) => {
                    state.pause(kind);
                    // Reachability may have returned before the pause was visible.
                    if inner.is_online() {
                        state.claim_resume()
                    } else {
                        None
                    }
                }
                None => {
                    state.set_fetch_status(FetchStatus::Idle);
                    None
                }
            }
        });
        if self.counted {
            inner.client.decrement_in_flight();
        }
        inner.notify();
        if let Some(kind) = resume {
            inner.spawn_cycle(kind);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    /// Runs one cycle of `kind`, superseding whatever cycle is running.
    ///
    /// Terminal fetch failures end in `Ok(())` and are reported through the state.
    pub(crate) async fn run_cycle(
        self: &Arc<Self>,
        kind: CycleKind,
        external: Option<CancellationToken>,
    ) -> Result<(), QueryError> {
        let key = &self.settings.key;
        if self.lifetime.is_cancelled() {
            return Err(QueryError::Disposed);
        }
        if !self.settings.enabled {
            self.with_state(|state| state.set_fetch_status(FetchStatus::Idle));
            self.notify();
            return Ok(());
        }

        let ticket = self.begin_request();
        // Linked before queueing on the lock so the caller's token can abort the wait.
        let scope = CancelScope::linked(&self.lifetime, external);
        let _lock = tokio::select! {
            lock = self.exec.lock() => lock,
            () = scope.token().cancelled() => return Err(self.cancel_reason()),
        };
        if !self.activate(ticket, scope.token()) {
            tracing::trace!(key = %key, ?kind, "superseded before start");
            return Err(QueryError::Cancelled);
        }
        if scope.is_cancelled() {
            self.clear_active();
            tracing::debug!(key = %key, ?kind, "cancelled before start");
            return Err(self.cancel_reason());
        }
        // Declared after the lock so it runs before the lock is released.
        let mut guard = CycleGuard {
            inner: self,
            counted: false,
            paused: None,
        };
        self.cancel_stale_timer();

        let entry = match self.client.get_entry::<V>(key) {
            Ok(entry) => entry,
            Err(error) => {
                self.with_state(|state| state.result.error = Some(error.clone()));
                return Err(error);
            }
        };
        if let Some(entry) = &entry {
            self.with_state(|state| {
                state.result.data = Some(entry.data.clone());
                state.result.data_updated_at = Some(entry.fetch_time);
                state.result.is_placeholder_data = false;
            });
            if !kind.is_refetch() && !entry.is_stale(self.settings.stale_time) {
                tracing::debug!(key = %key, "cached data is fresh");
                return Ok(());
            }
        }

        if self.settings.network_mode.pauses_before_fetch() && !self.is_online() {
            tracing::debug!(key = %key, ?kind, "offline, pausing before fetch");
            guard.paused = Some(kind);
            return Ok(());
        }

        let background = self.with_state(|state| {
            let background = kind != CycleKind::Refetch
                && state.result.data.is_some()
                && !state.result.is_placeholder_data;
            state.result.is_fetching_background = background;
            state.set_fetch_status(FetchStatus::Fetching);
            if !kind.is_refetch() {
                state.result.failure_count = 0;
                state.result.failure_reason = None;
                state.result.is_refetch_error = false;
            }
            background
        });
        self.client.increment_in_flight();
        guard.counted = true;
        self.notify();
        tracing::debug!(key = %key, ?kind, background, "fetch cycle started");

        let mut cycle = Cycle {
            kind,
            background,
            attempt_index: None,
        };
        self.attempt_loop(&mut cycle, &scope, &mut guard).await
    }

    async fn attempt_loop(
        self: &Arc<Self>,
        cycle: &mut Cycle,
        scope: &CancelScope,
        guard: &mut CycleGuard<'_, V>,
    ) -> Result<(), QueryError> {
        let key = &self.settings.key;
        let mode = self.settings.network_mode;
        loop {
            let first = cycle.attempt_index.is_none();
            let pause_if_offline = mode.pauses_before_fetch() || (mode.pauses_retries() && !first);
            let phase = self.begin_phase(scope.token(), pause_if_offline);
            let fetcher = self.settings.fetcher.clone();
            let context_key = key.clone();
            let meta = Arc::clone(&self.settings.meta);
            // The fetch may be shared with other instances on the key: it gets the
            // store's token, and this instance only stops awaiting it.
            let produce = move |cancellation: CancellationToken| {
                fetcher.call(QueryContext {
                    key: context_key,
                    cancellation,
                    meta,
                })
            };
            let outcome = tokio::select! {
                biased;
                () = phase.cancelled() => None,
                result = self.client.fetch_through(key, produce) => Some(result),
            };

            let error = match outcome {
                None => {
                    if scope.is_cancelled() {
                        tracing::debug!(key = %key, "fetch cancelled");
                        return Err(self.cancel_reason());
                    }
                    if mode.pauses_retries() && !self.is_online() {
                        tracing::debug!(key = %key, "attempt interrupted by outage, pausing");
                        guard.paused = Some(cycle.kind);
                        return Ok(());
                    }
                    continue;
                }
                Some(Ok(entry)) => match downcast_entry::<V>(key, entry) {
                    Ok(entry) => {
                        self.on_success(entry, cycle);
                        return Ok(());
                    }
                    Err(error) => {
                        tracing::error!(key = %key, %error, "fetched value has the wrong type");
                        self.with_state(|state| state.result.error = Some(error.clone()));
                        return Err(error);
                    }
                },
                Some(Err(error)) => error,
            };

            let attempt_index = cycle.attempt_index.map_or(0, |index| index.saturating_add(1));
            cycle.attempt_index = Some(attempt_index);
            self.with_state(|state| {
                state.result.failure_count = state.result.failure_count.saturating_add(1);
                state.result.failure_reason = Some(error.clone());
            });
            self.notify();

            if !self.settings.retry.should_retry(attempt_index, &error) {
                tracing::error!(key = %key, attempt = attempt_index, %error, "fetch failed");
                let is_refetch = cycle.is_refetch();
                self.with_state(|state| {
                    state.result.error = Some(error);
                    state.result.is_refetch_error = is_refetch;
                });
                return Ok(());
            }

            if mode.pauses_retries() && !self.is_online() {
                self.pause_until_online(scope).await?;
                continue;
            }

            let delay = self.settings.retry.delay(attempt_index, &error);
            tracing::warn!(
                key = %key,
                attempt = attempt_index,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "fetch failed, retrying after delay"
            );
            let wait = self.begin_phase(scope.token(), mode.pauses_retries());
            let interrupted = tokio::select! {
                biased;
                () = wait.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                if scope.is_cancelled() {
                    return Err(self.cancel_reason());
                }
                self.pause_until_online(scope).await?;
            }
        }
    }

    /// Blocks a retrying cycle until reachability comes back.
    async fn pause_until_online(&self, scope: &CancelScope) -> Result<(), QueryError> {
        // Register before the check so a reconnect in between is not lost.
        let waiter = self.resume.waiter();
        if self.is_online() {
            return Ok(());
        }
        tracing::debug!(key = %self.settings.key, "offline, pausing retries");
        self.with_state(|state| state.pause_waiting());
        self.notify();

        tokio::select! {
            resumed = waiter.wait() => resumed.map_err(|_| QueryError::Disposed)?,
            () = scope.token().cancelled() => return Err(self.cancel_reason()),
        }

        tracing::debug!(key = %self.settings.key, "back online, resuming retries");
        self.with_state(|state| state.set_fetch_status(FetchStatus::Fetching));
        self.notify();
        Ok(())
    }

    fn on_success(self: &Arc<Self>, entry: CacheEntry<V>, cycle: &Cycle) {
        tracing::debug!(
            key = %self.settings.key,
            kind = ?cycle.kind,
            retries = cycle.attempt_index.map_or(0, |index| index + 1),
            "fetch succeeded"
        );
        self.with_state(|state| {
            let result = &mut state.result;
            result.data = Some(entry.data);
            result.data_updated_at = Some(entry.fetch_time);
            result.is_placeholder_data = false;
            result.error = None;
            result.failure_reason = None;
            result.is_refetch_error = false;
        });
        if !cycle.kind.is_refetch() {
            self.arm_stale_timer();
        }
    }
}
