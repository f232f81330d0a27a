use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::key::QueryKey;

use super::config::NetworkMode;
use super::retry::{RetryDelay, RetryDelayFn, RetryPredicate};

/// Opaque key-value metadata handed to every fetch.
pub type Meta = Arc<HashMap<String, String>>;

/// Context passed to a fetch function.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub key: QueryKey,
    /// Cancelled once no query awaits this fetch any more. A fetch shared by
    /// several queries on one key keeps running while any of them still waits.
    /// Long-running fetches should observe it.
    pub cancellation: CancellationToken,
    pub meta: Meta,
}

/// A typed fetch function.
pub type QueryFn<V> =
    Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

/// Initial data, written through to the cache store on construction.
#[derive(Clone)]
pub enum InitialData<V> {
    Value(V),
    Func(Arc<dyn Fn() -> V + Send + Sync>),
}

impl<V: Clone> InitialData<V> {
    pub(crate) fn resolve(&self) -> V {
        match self {
            Self::Value(value) => value.clone(),
            Self::Func(f) => f(),
        }
    }
}

/// Placeholder data, shown until the first fetch lands but never cached.
#[derive(Clone)]
pub enum PlaceholderData<V> {
    Value(V),
    /// Receives the data currently displayed, if any.
    Func(Arc<dyn Fn(Option<&V>) -> Option<V> + Send + Sync>),
}

impl<V: Clone> PlaceholderData<V> {
    pub(crate) fn resolve(&self, previous: Option<&V>) -> Option<V> {
        match self {
            Self::Value(value) => Some(value.clone()),
            Self::Func(f) => f(previous),
        }
    }
}

/// Per-instance options for a [`Query`](crate::Query).
///
/// Options left unset inherit the client's [`QueryConfig`](crate::QueryConfig).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use freshen::{NetworkMode, QueryError, QueryOptions, query_key};
///
/// let options = QueryOptions::new(query_key!["user", 1])
///     .query_fn(|_ctx| Box::pin(async { Ok::<_, QueryError>("Ada".to_string()) }))
///     .stale_time(Duration::from_secs(5))
///     .network_mode(NetworkMode::OfflineFirst)
///     .retry(2);
/// assert_eq!(options.key().len(), 2);
/// ```
pub struct QueryOptions<V> {
    pub(crate) key: QueryKey,
    pub(crate) query_fn: Option<QueryFn<V>>,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) network_mode: Option<NetworkMode>,
    pub(crate) retry: Option<Option<u32>>,
    pub(crate) retry_infinite: bool,
    pub(crate) retry_if: Option<RetryPredicate>,
    pub(crate) retry_delay: RetryDelay,
    pub(crate) max_retry_delay: Option<Duration>,
    pub(crate) refetch_interval: Option<Duration>,
    pub(crate) refetch_on_reconnect: Option<bool>,
    pub(crate) refetch_on_window_focus: Option<bool>,
    pub(crate) refetch_on_stale: bool,
    pub(crate) fetch_on_bind: bool,
    pub(crate) enabled: bool,
    pub(crate) meta: Meta,
    pub(crate) initial_data: Option<InitialData<V>>,
    pub(crate) initial_data_updated_at: Option<Instant>,
    pub(crate) placeholder_data: Option<PlaceholderData<V>>,
}

impl<V> QueryOptions<V> {
    /// Creates options for `key` with everything else inherited or defaulted.
    #[must_use]
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            query_fn: None,
            stale_time: None,
            network_mode: None,
            retry: None,
            retry_infinite: false,
            retry_if: None,
            retry_delay: RetryDelay::Exponential,
            max_retry_delay: None,
            refetch_interval: None,
            refetch_on_reconnect: None,
            refetch_on_window_focus: None,
            refetch_on_stale: true,
            fetch_on_bind: false,
            enabled: true,
            meta: Arc::new(HashMap::new()),
            initial_data: None,
            initial_data_updated_at: None,
            placeholder_data: None,
        }
    }

    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Sets the fetch function. Required unless the client has a default one.
    #[must_use]
    pub fn query_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(QueryContext) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync + 'static,
    {
        self.query_fn = Some(Arc::new(f));
        self
    }

    /// How long fetched data stays fresh. Zero means always stale.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = Some(mode);
        self
    }

    /// Retries a failed attempt up to `count` times.
    #[must_use]
    pub fn retry(mut self, count: u32) -> Self {
        self.retry = Some(Some(count));
        self
    }

    /// Disables bounded retries (a predicate set with [`retry_if`](Self::retry_if) still applies).
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(None);
        self
    }

    /// Retries forever when `true`.
    #[must_use]
    pub fn retry_infinite(mut self, infinite: bool) -> Self {
        self.retry_infinite = infinite;
        self
    }

    /// Custom retry decision, consulted after the bounded count is exhausted.
    #[must_use]
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Waits a fixed delay between attempts.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = RetryDelay::Fixed(delay);
        self
    }

    #[must_use]
    pub fn retry_delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> Duration + Send + Sync + 'static,
    {
        let f: RetryDelayFn = Arc::new(f);
        self.retry_delay = RetryDelay::Custom(f);
        self
    }

    /// Caps the default exponential delay.
    #[must_use]
    pub fn max_retry_delay(mut self, max: Duration) -> Self {
        self.max_retry_delay = Some(max);
        self
    }

    /// Polls at a fixed interval while online.
    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    #[must_use]
    pub fn refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = Some(enabled);
        self
    }

    /// Refetches in the background once fetched data turns stale. Defaults to `true`.
    #[must_use]
    pub fn refetch_on_stale(mut self, enabled: bool) -> Self {
        self.refetch_on_stale = enabled;
        self
    }

    /// Runs one fetch cycle right after construction. Defaults to `false`.
    #[must_use]
    pub fn fetch_on_bind(mut self, enabled: bool) -> Self {
        self.fetch_on_bind = enabled;
        self
    }

    /// A disabled query never fetches on its own and ignores manual fetches.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: HashMap<String, String>) -> Self {
        self.meta = Arc::new(meta);
        self
    }

    #[must_use]
    pub fn initial_data(mut self, data: V) -> Self {
        self.initial_data = Some(InitialData::Value(data));
        self
    }

    #[must_use]
    pub fn initial_data_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        self.initial_data = Some(InitialData::Func(Arc::new(f)));
        self
    }

    /// Backdates the cache entry created from initial data.
    #[must_use]
    pub fn initial_data_updated_at(mut self, at: Instant) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }

    #[must_use]
    pub fn placeholder_data(mut self, data: V) -> Self {
        self.placeholder_data = Some(PlaceholderData::Value(data));
        self
    }

    #[must_use]
    pub fn placeholder_data_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&V>) -> Option<V> + Send + Sync + 'static,
    {
        self.placeholder_data = Some(PlaceholderData::Func(Arc::new(f)));
        self
    }
}

impl<V> fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("stale_time", &self.stale_time)
            .field("network_mode", &self.network_mode)
            .field("retry", &self.retry)
            .field("retry_infinite", &self.retry_infinite)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_interval", &self.refetch_interval)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
