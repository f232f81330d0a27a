//! The fetch orchestrator bound to one key.
//!
//! A [`Query`] owns the observable state of one consumer binding. Fetch cycles
//! are requested by manual calls, the stale timer, polling and the events the
//! query listens to (reachability, focus, invalidation, cancellation), and are
//! serialized so that at most one runs at a time. The newest request wins.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::TryFutureExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::key::QueryKey;

use super::client::{DefaultQueryFn, ErasedValue, KeySet, QueryClient};
use super::config::NetworkMode;
use super::cycle::CycleKind;
use super::listeners::{Listener, ListenerId, Listeners};
use super::options::{Meta, QueryContext, QueryFn, QueryOptions};
use super::retry::RetryPolicy;
use super::signal::ResumeSignal;
use super::state::{FetchStatus, QueryResult};

/// The fetch function an instance resolved at construction.
pub(super) enum Fetcher<V> {
    Typed(QueryFn<V>),
    /// The client's store-wide function; its values are downcast after the fetch.
    Default(DefaultQueryFn),
}

impl<V> Clone for Fetcher<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Typed(f) => Self::Typed(Arc::clone(f)),
            Self::Default(f) => Self::Default(Arc::clone(f)),
        }
    }
}

impl<V: Send + Sync + 'static> Fetcher<V> {
    pub(super) fn call(
        &self,
        context: QueryContext,
    ) -> BoxFuture<'static, Result<ErasedValue, QueryError>> {
        match self {
            Self::Typed(f) => f(context)
                .map_ok(|value| -> ErasedValue { Arc::new(value) })
                .boxed(),
            Self::Default(f) => f(context),
        }
    }
}

/// Options resolved against the client's defaults.
pub(super) struct Settings<V> {
    pub(super) key: QueryKey,
    pub(super) fetcher: Fetcher<V>,
    pub(super) stale_time: Duration,
    pub(super) network_mode: NetworkMode,
    pub(super) retry: RetryPolicy,
    pub(super) refetch_interval: Option<Duration>,
    pub(super) refetch_on_reconnect: bool,
    pub(super) refetch_on_window_focus: bool,
    pub(super) refetch_on_stale: bool,
    pub(super) enabled: bool,
    pub(super) meta: Meta,
}

impl<V> Settings<V> {
    fn resolve(options: &mut QueryOptions<V>, client: &QueryClient) -> Result<Self, QueryError> {
        let fetcher = match (options.query_fn.take(), client.default_query_fn()) {
            (Some(f), _) => Fetcher::Typed(f),
            (None, Some(f)) => Fetcher::Default(f),
            (None, None) => {
                return Err(QueryError::MissingQueryFn {
                    key: options.key.clone(),
                });
            }
        };
        let config = client.config();
        let retry = RetryPolicy {
            infinite: options.retry_infinite,
            count: options.retry.unwrap_or(config.retry),
            predicate: options.retry_if.take(),
            delay: options.retry_delay.clone(),
            max_delay: options.max_retry_delay.unwrap_or(config.max_retry_delay),
        };
        Ok(Self {
            key: options.key.clone(),
            fetcher,
            stale_time: options.stale_time.unwrap_or(config.stale_time),
            network_mode: options.network_mode.unwrap_or(config.network_mode),
            retry,
            refetch_interval: options.refetch_interval,
            refetch_on_reconnect: options
                .refetch_on_reconnect
                .unwrap_or(config.refetch_on_reconnect),
            refetch_on_window_focus: options
                .refetch_on_window_focus
                .unwrap_or(config.refetch_on_window_focus),
            refetch_on_stale: options.refetch_on_stale,
            enabled: options.enabled,
            meta: Arc::clone(&options.meta),
        })
    }
}

/// Observable state plus the bookkeeping that must change atomically with it.
pub(super) struct Slot<V> {
    pub(super) result: QueryResult<V>,
    /// Kind of the cycle that paused, replayed on resume.
    paused_kind: CycleKind,
    /// Set once a resumption is arranged for the current pause.
    resume_claimed: bool,
}

impl<V> Slot<V> {
    pub(super) fn set_fetch_status(&mut self, status: FetchStatus) {
        self.result.fetch_status = status;
        if status != FetchStatus::Paused {
            self.resume_claimed = false;
        }
    }

    /// Pauses a cycle that gave up the lock. Some later cycle has to resume it.
    pub(super) fn pause(&mut self, kind: CycleKind) {
        self.result.fetch_status = FetchStatus::Paused;
        self.paused_kind = kind;
        self.resume_claimed = false;
    }

    /// Pauses a cycle blocked on the resume signal, which resumes it itself.
    pub(super) fn pause_waiting(&mut self) {
        self.result.fetch_status = FetchStatus::Paused;
        self.resume_claimed = true;
    }

    pub(super) fn claim_resume(&mut self) -> Option<CycleKind> {
        if self.result.fetch_status != FetchStatus::Paused || self.resume_claimed {
            return None;
        }
        self.resume_claimed = true;
        Some(self.paused_kind)
    }
}

/// The running cycle's cancellation handles.
#[derive(Default)]
struct Active {
    generation: u64,
    scope: Option<CancellationToken>,
    /// Current attempt or retry delay. Cancelled alone when reachability drops.
    phase: Option<CancellationToken>,
}

pub(super) struct Inner<V> {
    pub(super) settings: Settings<V>,
    pub(super) client: Arc<QueryClient>,
    runtime: Handle,
    state: Mutex<Slot<V>>,
    pub(super) exec: tokio::sync::Mutex<()>,
    active: Mutex<Active>,
    pub(super) resume: ResumeSignal,
    listeners: Listeners,
    pub(super) lifetime: CancellationToken,
    stale_timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<V> Inner<V> {
    fn lock_state(&self) -> MutexGuard<'_, Slot<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut Slot<V>) -> R) -> R {
        f(&mut self.lock_state())
    }

    pub(super) fn notify(&self) {
        self.listeners.notify();
    }

    pub(super) fn fetch_status(&self) -> FetchStatus {
        self.lock_state().result.fetch_status
    }

    pub(super) fn is_online(&self) -> bool {
        self.client.online_manager().is_online()
    }

    pub(super) fn is_stale(&self) -> bool {
        self.client.is_stale(&self.settings.key, self.settings.stale_time)
    }

    /// Error reported by a cycle whose scope was cancelled.
    pub(super) fn cancel_reason(&self) -> QueryError {
        if self.lifetime.is_cancelled() {
            QueryError::Disposed
        } else {
            QueryError::Cancelled
        }
    }

    /// Supersedes the running cycle and returns the ticket of the new request.
    pub(super) fn begin_request(&self) -> u64 {
        let mut active = self.lock_active();
        active.generation += 1;
        if let Some(scope) = &active.scope {
            scope.cancel();
        }
        active.generation
    }

    /// Installs `scope` for the cycle holding `ticket`. Returns `false` if a
    /// newer request arrived meanwhile.
    pub(super) fn activate(&self, ticket: u64, scope: &CancellationToken) -> bool {
        let mut active = self.lock_active();
        if active.generation != ticket {
            return false;
        }
        active.scope = Some(scope.clone());
        active.phase = None;
        true
    }

    /// Starts an attempt or delay, cancelled up front when it would only be
    /// interrupted by the current outage.
    pub(super) fn begin_phase(
        &self,
        scope: &CancellationToken,
        pause_if_offline: bool,
    ) -> CancellationToken {
        let phase = scope.child_token();
        let mut active = self.lock_active();
        if pause_if_offline && !self.is_online() {
            phase.cancel();
        }
        active.phase = Some(phase.clone());
        phase
    }

    pub(super) fn clear_active(&self) {
        let mut active = self.lock_active();
        active.scope = None;
        active.phase = None;
    }

    fn cancel_active(&self) -> bool {
        let active = self.lock_active();
        active.scope.as_ref().is_some_and(|scope| {
            scope.cancel();
            true
        })
    }

    fn interrupt_phase(&self) {
        if let Some(phase) = &self.lock_active().phase {
            phase.cancel();
        }
    }

    pub(super) fn cancel_stale_timer(&self) {
        let timer = self
            .stale_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Tears the instance down. Idempotent.
    pub(super) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(key = %self.settings.key, "disposing query");
        self.lifetime.cancel();
        self.resume.dispose();
        self.cancel_stale_timer();
        self.listeners.clear();
    }
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    fn snapshot(&self) -> QueryResult<V> {
        self.lock_state().result.clone()
    }

    /// Runs a cycle of `kind` on its own task.
    pub(super) fn spawn_cycle(self: &Arc<Self>, kind: CycleKind) {
        if self.lifetime.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match inner.run_cycle(kind, None).await {
                Ok(()) => {}
                Err(QueryError::Cancelled | QueryError::Disposed) => {
                    tracing::trace!(key = %inner.settings.key, ?kind, "background cycle aborted");
                }
                Err(error) => {
                    tracing::debug!(
                        key = %inner.settings.key,
                        ?kind,
                        %error,
                        "background cycle failed"
                    );
                }
            }
        });
    }

    /// Schedules one background refetch once fetched data turns stale.
    pub(super) fn arm_stale_timer(self: &Arc<Self>) {
        let stale_time = self.settings.stale_time;
        if !self.settings.refetch_on_stale || stale_time.is_zero() || self.lifetime.is_cancelled() {
            return;
        }
        let weak = Arc::downgrade(self);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(stale_time).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_online() && inner.fetch_status() == FetchStatus::Idle {
                tracing::trace!(key = %inner.settings.key, "stale timer fired");
                inner.spawn_cycle(CycleKind::Background);
            }
        });
        let previous = self
            .stale_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn start_polling(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        let lifetime = self.lifetime.clone();
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let ticks = IntervalStream::new(interval).take_until(lifetime.cancelled_owned());
            let mut ticks = std::pin::pin!(ticks);
            while ticks.next().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_poll_tick();
            }
        });
    }

    fn on_poll_tick(self: &Arc<Self>) {
        if !self.settings.enabled
            || !self.is_online()
            || self.fetch_status() == FetchStatus::Fetching
        {
            return;
        }
        let has_data = {
            let state = self.lock_state();
            state.result.data.is_some() && !state.result.is_placeholder_data
        };
        let kind = if has_data {
            CycleKind::Background
        } else {
            CycleKind::Fetch
        };
        tracing::trace!(key = %self.settings.key, ?kind, "poll tick");
        self.spawn_cycle(kind);
    }

    fn on_reachability(self: &Arc<Self>, online: bool) {
        tracing::trace!(key = %self.settings.key, online, "reachability changed");
        let mode = self.settings.network_mode;
        if !online {
            if mode.pauses_retries() {
                self.interrupt_phase();
            }
            return;
        }
        if self.resume.release() {
            return;
        }
        let (resume, idle) = self.with_state(|state| {
            let idle = state.result.fetch_status == FetchStatus::Idle;
            (state.claim_resume(), idle)
        });
        if let Some(kind) = resume {
            tracing::debug!(key = %self.settings.key, ?kind, "resuming paused cycle");
            self.spawn_cycle(kind);
        } else if idle
            && self.settings.enabled
            && self.settings.refetch_on_reconnect
            && mode != NetworkMode::Always
            && self.is_stale()
        {
            self.spawn_cycle(CycleKind::Fetch);
        }
    }

    fn on_focus(self: &Arc<Self>, focused: bool) {
        if !focused || !self.settings.enabled || !self.settings.refetch_on_window_focus {
            return;
        }
        if self.fetch_status() == FetchStatus::Idle && self.is_stale() {
            tracing::trace!(key = %self.settings.key, "focus regained with stale data");
            self.spawn_cycle(CycleKind::Fetch);
        }
    }

    fn on_invalidated(self: &Arc<Self>, keys: &KeySet) {
        if self.settings.enabled && keys.contains(&self.settings.key) {
            tracing::trace!(key = %self.settings.key, "invalidated");
            self.spawn_cycle(CycleKind::Fetch);
        }
    }

    fn on_cancelled(&self, keys: &KeySet) {
        if keys.contains(&self.settings.key) && self.cancel_active() {
            tracing::debug!(key = %self.settings.key, "cancelled by broadcast");
        }
    }
}

struct EventReceivers {
    online: broadcast::Receiver<bool>,
    focus: broadcast::Receiver<bool>,
    invalidated: broadcast::Receiver<KeySet>,
    cancelled: broadcast::Receiver<KeySet>,
}

async fn watch_events<V>(
    weak: Weak<Inner<V>>,
    lifetime: CancellationToken,
    mut events: EventReceivers,
)
where
    V: Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            () = lifetime.cancelled() => break,
            event = events.online.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(online) => inner.on_reachability(online),
                    Err(RecvError::Lagged(_)) => inner.on_reachability(inner.is_online()),
                    Err(RecvError::Closed) => break,
                }
            }
            event = events.focus.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(focused) => inner.on_focus(focused),
                    Err(RecvError::Lagged(_)) => {
                        inner.on_focus(inner.client.focus_manager().is_focused());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = events.invalidated.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(keys) => inner.on_invalidated(&keys),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            key = %inner.settings.key,
                            skipped,
                            "invalidation events dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = events.cancelled.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(keys) => inner.on_cancelled(&keys),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            key = %inner.settings.key,
                            skipped,
                            "cancellation events dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// A query instance: one consumer's binding to a key.
///
/// Dropping the handle disposes the instance: timers stop, event
/// subscriptions end and any outstanding cycle fails with
/// [`QueryError::Disposed`]. The cache entry it wrote stays in the client.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use freshen::{Query, QueryClient, QueryError, QueryOptions, query_key};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), QueryError> {
/// let client = Arc::new(QueryClient::new());
/// let query = Query::new(
///     QueryOptions::new(query_key!["user", 1])
///         .query_fn(|_ctx| Box::pin(async { Ok::<_, QueryError>("Ada".to_string()) })),
///     client,
/// )?;
///
/// query.fetch().await?;
/// assert_eq!(query.result().data(), Some(&"Ada".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct Query<V> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + Sync + 'static> Query<V> {
    /// Binds a new instance to `options.key()`.
    ///
    /// Initial data is written through to the client unless it already holds
    /// an entry for the key, in which case the cached entry is shown. Otherwise
    /// placeholder data is shown without being cached.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Config`] when called outside a Tokio runtime.
    /// - [`QueryError::MissingQueryFn`] when neither the options nor the client
    ///   provide a fetch function.
    /// - [`QueryError::TypeMismatch`] when the cached entry holds another type.
    pub fn new(mut options: QueryOptions<V>, client: Arc<QueryClient>) -> Result<Self, QueryError> {
        let runtime = Handle::try_current().map_err(|error| {
            QueryError::Config(format!("a query needs a Tokio runtime: {error}"))
        })?;
        let settings = Settings::resolve(&mut options, &client)?;
        let key = settings.key.clone();

        if let Some(initial) = &options.initial_data {
            let fetch_time = options.initial_data_updated_at.unwrap_or_else(Instant::now);
            client.seed(&key, initial.resolve(), fetch_time);
        }
        let mut result = QueryResult::default();
        match client.get_entry::<V>(&key)? {
            Some(entry) => {
                result.data = Some(entry.data);
                result.data_updated_at = Some(entry.fetch_time);
            }
            None => {
                if let Some(placeholder) = &options.placeholder_data {
                    result.data = placeholder.resolve(None);
                    result.is_placeholder_data = result.data.is_some();
                }
            }
        }

        let events = EventReceivers {
            online: client.online_manager().subscribe(),
            focus: client.focus_manager().subscribe(),
            invalidated: client.subscribe_invalidation(),
            cancelled: client.subscribe_cancellation(),
        };
        let inner = Arc::new(Inner {
            settings,
            client,
            runtime,
            state: Mutex::new(Slot {
                result,
                paused_kind: CycleKind::Fetch,
                resume_claimed: false,
            }),
            exec: tokio::sync::Mutex::new(()),
            active: Mutex::new(Active::default()),
            resume: ResumeSignal::new(),
            listeners: Listeners::new(),
            lifetime: CancellationToken::new(),
            stale_timer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        tracing::debug!(key = %key, "query bound");
        inner
            .runtime
            .spawn(watch_events(Arc::downgrade(&inner), inner.lifetime.clone(), events));
        if let Some(period) = inner.settings.refetch_interval.filter(|period| !period.is_zero()) {
            inner.start_polling(period);
        }
        if options.fetch_on_bind {
            inner.spawn_cycle(CycleKind::Fetch);
        }
        Ok(Self { inner })
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.settings.key
    }

    /// Returns a snapshot of the observable state.
    pub fn result(&self) -> QueryResult<V> {
        self.inner.snapshot()
    }

    /// Runs a fetch cycle. Fresh cached data short-circuits it.
    ///
    /// Fetch failures do not surface here once retries are exhausted: they are
    /// reported through [`result`](Self::result).
    ///
    /// # Errors
    ///
    /// - [`QueryError::Cancelled`] when a newer request or a cancellation
    ///   superseded this cycle.
    /// - [`QueryError::Disposed`] when the instance was torn down meanwhile.
    /// - [`QueryError::TypeMismatch`] when the fetched or cached value has another type.
    pub async fn fetch(&self) -> Result<(), QueryError> {
        self.inner.run_cycle(CycleKind::Fetch, None).await
    }

    /// Like [`fetch`](Self::fetch), also aborted when `cancellation` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn fetch_with(&self, cancellation: CancellationToken) -> Result<(), QueryError> {
        self.inner.run_cycle(CycleKind::Fetch, Some(cancellation)).await
    }

    /// Runs a fetch cycle even if the cached data is fresh.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn refetch(&self) -> Result<(), QueryError> {
        self.inner.run_cycle(CycleKind::Refetch, None).await
    }

    /// Returns `true` if the cached entry is missing, invalidated or older than the stale time.
    pub fn is_stale(&self) -> bool {
        self.inner.is_stale()
    }

    /// Cancels the running cycle, if any. Its caller observes [`QueryError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.inner.cancel_active()
    }

    /// Registers a callback invoked after every observable change.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Streams a snapshot after every observable change, ending on disposal.
    ///
    /// A slow consumer skips intermediate changes but always sees a current snapshot.
    pub fn changes(&self) -> BoxStream<'static, QueryResult<V>> {
        let weak = Arc::downgrade(&self.inner);
        BroadcastStream::new(self.inner.listeners.receiver())
            .take_until(self.inner.lifetime.clone().cancelled_owned())
            .filter_map(move |_| {
                let snapshot = weak.upgrade().map(|inner| inner.snapshot());
                async move { snapshot }
            })
            .boxed()
    }

    /// Disposes the instance. Idempotent, and implied by dropping the handle.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }
}

impl<V> Drop for Query<V> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<V> fmt::Debug for Query<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Query")
            .field("key", &self.inner.settings.key)
            .field("fetch_status", &state.result.fetch_status)
            .field("failure_count", &state.result.failure_count)
            .field("has_data", &state.result.data.is_some())
            .field("error", &state.result.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::sync::atomic::AtomicU32;

    fn counting_query(
        client: &Arc<QueryClient>,
        calls: &Arc<AtomicU32>,
        options: impl FnOnce(QueryOptions<u32>) -> QueryOptions<u32>,
    ) -> Query<u32> {
        let calls = calls.clone();
        let options = options(QueryOptions::new(query_key!["counter"])).query_fn(move |_ctx| {
            let calls = calls.clone();
            Box::pin(async move { Ok::<_, QueryError>(calls.fetch_add(1, Ordering::SeqCst) + 1) })
        });
        Query::new(options, client.clone()).expect("query should build")
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let client = Arc::new(QueryClient::new());
        let options = QueryOptions::new("todos")
            .query_fn(|_ctx| Box::pin(async { Ok::<u32, QueryError>(1) }));
        let err = Query::new(options, client).expect_err("no runtime");
        assert!(matches!(err, QueryError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_without_query_fn_fails() {
        let client = Arc::new(QueryClient::new());
        let err = Query::<u32>::new(QueryOptions::new("todos"), client)
            .expect_err("no fetch function");
        assert_eq!(
            err,
            QueryError::MissingQueryFn {
                key: query_key!["todos"]
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_populates_state() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| options);

        assert!(query.result().is_pending());
        query.fetch().await.unwrap();

        let result = query.result();
        assert!(result.is_success());
        assert_eq!(result.data, Some(1));
        assert_eq!(result.fetch_status, FetchStatus::Idle);
        assert!(result.data_updated_at.is_some());
        assert_eq!(client.get_query_data::<u32>(query.key()), Some(1));
        assert_eq!(client.is_fetching(), 0);
    }

    #[tokio::test]
    async fn test_refetch_bypasses_freshness() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| {
            options.stale_time(Duration::from_secs(60))
        });

        query.fetch().await.unwrap();
        query.fetch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        query.refetch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(query.result().data, Some(2));
    }

    #[tokio::test]
    async fn test_disabled_query_ignores_fetch() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| options.enabled(false));

        query.fetch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(query.result().fetch_status, FetchStatus::Idle);
    }

    #[tokio::test]
    async fn test_fetch_after_dispose() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| options);

        query.dispose();
        query.dispose();
        assert!(query.is_disposed());
        assert_eq!(query.fetch().await, Err(QueryError::Disposed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_ticks_until_disposed() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| {
            options.refetch_interval(Duration::from_secs(2))
        });

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        query.dispose();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| options);

        let notified = Arc::new(AtomicU32::new(0));
        let counter = notified.clone();
        let id = query.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        query.fetch().await.unwrap();
        let seen = notified.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected start and finish notifications, got {seen}");

        assert!(query.unsubscribe(id));
        query.refetch().await.unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_changes_stream_ends_on_dispose() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_query(&client, &calls, |options| options);
        let mut changes = query.changes();

        query.fetch().await.unwrap();
        let first = changes.next().await.expect("a change should be streamed");
        assert_eq!(first.data, Some(1));

        query.dispose();
        while changes.next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_default_query_fn_type_mismatch() {
        let client = Arc::new(QueryClient::new().with_default_query_fn(|ctx: QueryContext| {
            Box::pin(async move { Ok::<ErasedValue, QueryError>(Arc::new(ctx.key.to_string())) })
        }));
        let query = Query::<u32>::new(QueryOptions::new("todos"), client).unwrap();

        let err = query.fetch().await.expect_err("string is not u32");
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
        assert!(query.result().is_error());
    }

    #[tokio::test]
    async fn test_default_query_fn_matching_type() {
        let client = Arc::new(QueryClient::new().with_default_query_fn(|ctx: QueryContext| {
            Box::pin(async move { Ok::<ErasedValue, QueryError>(Arc::new(ctx.key.to_string())) })
        }));
        let query = Query::<String>::new(QueryOptions::new("todos"), client).unwrap();

        query.fetch().await.unwrap();
        assert_eq!(query.result().data.as_deref(), Some(r#"["todos"]"#));
    }

    #[tokio::test]
    async fn test_cached_entry_of_other_type_fails_construction() {
        let client = Arc::new(QueryClient::new());
        client.set_query_data(query_key!["counter"], "text".to_string());
        let options = QueryOptions::new("counter")
            .query_fn(|_ctx| Box::pin(async { Ok::<u32, QueryError>(1) }));

        let err = Query::new(options, client).expect_err("cached type differs");
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_meta_reaches_fetch_function() {
        let client = Arc::new(QueryClient::new());
        let options = QueryOptions::new("todos")
            .meta(std::collections::HashMap::from([("tenant".to_string(), "acme".to_string())]))
            .query_fn(|ctx: QueryContext| {
                let tenant = ctx.meta.get("tenant").cloned().unwrap_or_default();
                Box::pin(async move { Ok::<_, QueryError>(tenant) })
            });
        let query = Query::new(options, client).unwrap();

        query.fetch().await.unwrap();
        assert_eq!(query.result().data.as_deref(), Some("acme"));
    }
}
