use std::time::Duration;

use tokio::time::Instant;

/// A cached value with the instant of its last successful fetch.
///
/// Entries never expire by themselves: staleness is computed when read, from
/// `fetch_time` and the reader's stale time.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetch_time: Instant,
    /// Set by an explicit invalidation, cleared by the next successful fetch.
    pub is_invalidated: bool,
}

impl<T> CacheEntry<T> {
    /// Creates a new cache entry stamped now.
    pub fn new(data: T) -> Self {
        Self::with_fetch_time(data, Instant::now())
    }

    /// Creates an entry with an explicit fetch time, used to backdate initial data.
    pub const fn with_fetch_time(data: T, fetch_time: Instant) -> Self {
        Self {
            data,
            fetch_time,
            is_invalidated: false,
        }
    }

    /// Checks if this entry is stale for the given stale time.
    ///
    /// A zero stale time means data is stale as soon as it lands.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.is_invalidated || stale_time.is_zero() || self.fetch_time.elapsed() > stale_time
    }

    /// Marks this entry as invalidated so the next staleness check reports stale.
    pub const fn mark_invalidated(&mut self) {
        self.is_invalidated = true;
    }

    /// Maps the data while keeping timestamp and invalidation state.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            fetch_time: self.fetch_time,
            is_invalidated: self.is_invalidated,
        }
    }
}
