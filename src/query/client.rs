use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::focus::FocusManager;
use crate::key::QueryKey;
use crate::network::OnlineManager;

use super::cache::CacheEntry;
use super::config::QueryConfig;
use super::options::QueryContext;

/// A type-erased cached value.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A store-wide fetch function producing type-erased values.
pub type DefaultQueryFn = Arc<
    dyn Fn(QueryContext) -> BoxFuture<'static, Result<ErasedValue, QueryError>> + Send + Sync,
>;

/// Key sets carried by the invalidation and cancellation broadcasts.
pub type KeySet = Arc<Vec<QueryKey>>;

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry<ErasedValue>, QueryError>>>;

const BROADCAST_CAPACITY: usize = 100;

/// The shared, key-indexed cache store.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results by structural key
/// - De-duplicating concurrent fetches of the same key
/// - Broadcasting invalidation and cancellation notifications
/// - Holding the reachability and focus sources bound queries listen to
///
/// # Example
///
/// ```rust
/// use freshen::{QueryClient, QueryConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let config = QueryConfig::new(Duration::from_secs(30));
/// let client = Arc::new(QueryClient::with_config(config));
/// assert_eq!(client.is_fetching(), 0);
/// ```
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<DashMap<QueryKey, CacheEntry<ErasedValue>>>,
    in_flight: Arc<DashMap<QueryKey, InFlight>>,
    next_fetch_id: Arc<AtomicU64>,
    fetching: Arc<AtomicUsize>,
    invalidation_tx: broadcast::Sender<KeySet>,
    cancellation_tx: broadcast::Sender<KeySet>,
    online: OnlineManager,
    focus: FocusManager,
    default_query_fn: Option<DefaultQueryFn>,
    config: QueryConfig,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        let (invalidation_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (cancellation_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            cache: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            next_fetch_id: Arc::new(AtomicU64::new(0)),
            fetching: Arc::new(AtomicUsize::new(0)),
            invalidation_tx,
            cancellation_tx,
            online: OnlineManager::default(),
            focus: FocusManager::default(),
            default_query_fn: None,
            config,
        }
    }

    /// Uses the given reachability source instead of an always-online default.
    #[must_use]
    pub fn with_online_manager(mut self, online: OnlineManager) -> Self {
        self.online = online;
        self
    }

    #[must_use]
    pub fn with_focus_manager(mut self, focus: FocusManager) -> Self {
        self.focus = focus;
        self
    }

    /// Sets a fetch function used by queries that do not bring their own.
    ///
    /// Its values are type-erased; a query expecting another type fails with
    /// [`QueryError::TypeMismatch`].
    #[must_use]
    pub fn with_default_query_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(QueryContext) -> BoxFuture<'static, Result<ErasedValue, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        self.default_query_fn = Some(Arc::new(f));
        self
    }

    /// Gets the query configuration.
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub const fn online_manager(&self) -> &OnlineManager {
        &self.online
    }

    pub const fn focus_manager(&self) -> &FocusManager {
        &self.focus
    }

    pub(crate) fn default_query_fn(&self) -> Option<DefaultQueryFn> {
        self.default_query_fn.clone()
    }

    /// Gets the cached entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the entry holds another type.
    pub fn get_entry<T>(&self, key: &QueryKey) -> Result<Option<CacheEntry<T>>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(entry) = self.cache.get(key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        downcast_entry(key, entry).map(Some)
    }

    /// Gets the cached data for `key`, ignoring entries of another type.
    pub fn get_query_data<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_entry(key).ok().flatten().map(|entry| entry.data)
    }

    /// Writes data for `key`.
    ///
    /// An existing entry keeps its fetch time: only a fetch advances it.
    pub fn set_query_data<T>(&self, key: QueryKey, data: T)
    where
        T: Send + Sync + 'static,
    {
        let data: ErasedValue = Arc::new(data);
        self.cache
            .entry(key)
            .and_modify(|entry| entry.data = Arc::clone(&data))
            .or_insert_with(|| CacheEntry::new(Arc::clone(&data)));
    }

    /// Creates the entry for `key` unless one exists. Returns `true` if it was created.
    pub(crate) fn seed<T>(&self, key: &QueryKey, data: T, fetch_time: tokio::time::Instant) -> bool
    where
        T: Send + Sync + 'static,
    {
        match self.cache.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let data: ErasedValue = Arc::new(data);
                slot.insert(CacheEntry::with_fetch_time(data, fetch_time));
                true
            }
        }
    }

    /// Returns `true` if `key` has no entry or its entry is stale for `stale_time`.
    pub fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
        self.cache
            .get(key)
            .is_none_or(|entry| entry.is_stale(stale_time))
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.cache.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Runs `producer` for `key` unless a fetch for the same key is already in
    /// flight, in which case its outcome is shared and `producer` is never called.
    ///
    /// The producer receives a token owned by the shared fetch. It is cancelled
    /// only once every caller awaiting the fetch has gone, so one caller giving
    /// up never aborts the fetch for the others.
    ///
    /// On success the entry is written once, stamped now, and returned.
    ///
    /// # Errors
    ///
    /// Propagates the producer's error to every caller sharing the fetch.
    pub async fn fetch_through<F>(
        &self,
        key: &QueryKey,
        producer: F,
    ) -> Result<CacheEntry<ErasedValue>, QueryError>
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<ErasedValue, QueryError>>
            + Send
            + 'static,
    {
        let joined = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(slot) => slot.get().join(),
            Entry::Vacant(slot) => {
                // The producer is deferred into the shared future, so no user
                // code runs under the map lock.
                let cancellation = CancellationToken::new();
                let fetch = self.write_through(key.clone(), producer, cancellation.clone());
                let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(InFlight {
                    id,
                    fetch,
                    callers: Arc::new(()),
                    cancellation,
                })
                .join()
            }
        };
        let (id, fetch, ticket) = joined;

        let _release = InFlightSlot {
            in_flight: &self.in_flight,
            key,
            id,
            ticket: Some(ticket),
        };
        fetch.await
    }

    fn write_through<F>(
        &self,
        key: QueryKey,
        producer: F,
        cancellation: CancellationToken,
    ) -> SharedFetch
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<ErasedValue, QueryError>>
            + Send
            + 'static,
    {
        let cache = Arc::clone(&self.cache);
        async move {
            let data = producer(cancellation).await?;
            let entry = CacheEntry::new(data);
            cache.insert(key, entry.clone());
            Ok(entry)
        }
        .boxed()
        .shared()
    }

    /// Marks `key` invalidated and notifies bound queries.
    pub fn invalidate(&self, key: &QueryKey) {
        self.invalidate_queries([key.clone()]);
    }

    /// Marks every key invalidated, then broadcasts the set to bound queries.
    pub fn invalidate_queries(&self, keys: impl IntoIterator<Item = QueryKey>) {
        let keys: Vec<QueryKey> = keys.into_iter().collect();
        for key in &keys {
            if let Some(mut entry) = self.cache.get_mut(key) {
                entry.mark_invalidated();
            }
        }
        tracing::debug!(count = keys.len(), "invalidating queries");
        let _ = self.invalidation_tx.send(Arc::new(keys));
    }

    /// Asks bound queries for these keys to cancel their in-flight fetch.
    pub fn cancel_queries(&self, keys: impl IntoIterator<Item = QueryKey>) {
        let keys: Vec<QueryKey> = keys.into_iter().collect();
        tracing::debug!(count = keys.len(), "cancelling queries");
        let _ = self.cancellation_tx.send(Arc::new(keys));
    }

    /// Subscribes to invalidation notifications.
    pub fn subscribe_invalidation(&self) -> broadcast::Receiver<KeySet> {
        self.invalidation_tx.subscribe()
    }

    /// Subscribes to cancellation notifications.
    pub fn subscribe_cancellation(&self) -> broadcast::Receiver<KeySet> {
        self.cancellation_tx.subscribe()
    }

    /// Number of fetch cycles currently fetching across all bound queries.
    pub fn is_fetching(&self) -> usize {
        self.fetching.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_in_flight(&self) {
        self.fetching.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_in_flight(&self) {
        let _ = self
            .fetching
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.cache.len())
            .field("in_flight", &self.in_flight.len())
            .field("fetching", &self.is_fetching())
            .field("online", &self.online.is_online())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Downcasts an erased entry to `T`.
pub(crate) fn downcast_entry<T>(
    key: &QueryKey,
    entry: CacheEntry<ErasedValue>,
) -> Result<CacheEntry<T>, QueryError>
where
    T: Clone + Send + Sync + 'static,
{
    let Some(data) = entry.data.downcast_ref::<T>().cloned() else {
        return Err(QueryError::TypeMismatch {
            key: key.clone(),
            expected: type_name::<T>(),
        });
    };
    Ok(entry.map(|_| data))
}

/// A shared fetch and the callers awaiting it.
struct InFlight {
    id: u64,
    fetch: SharedFetch,
    /// One clone per awaiting caller, plus the map's own.
    callers: Arc<()>,
    /// Handed to the producer; cancelled when the last caller leaves early.
    cancellation: CancellationToken,
}

impl InFlight {
    fn join(&self) -> (u64, SharedFetch, Arc<()>) {
        (self.id, self.fetch.clone(), Arc::clone(&self.callers))
    }
}

/// Releases the in-flight slot once its last caller finishes or is dropped,
/// so the next request for the key starts a new fetch.
struct InFlightSlot<'a> {
    in_flight: &'a DashMap<QueryKey, InFlight>,
    key: &'a QueryKey,
    id: u64,
    ticket: Option<Arc<()>>,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        drop(self.ticket.take());
        let released = self.in_flight.remove_if(self.key, |_, slot| {
            slot.id == self.id && Arc::strong_count(&slot.callers) == 1
        });
        if let Some((_, slot)) = released {
            if slot.fetch.peek().is_none() {
                slot.cancellation.cancel();
            }
        }
    }
}
