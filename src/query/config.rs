use std::time::Duration;

/// Policy for pausing fetches and retries while the network is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Never start a fetch while offline; pause retries until reconnect.
    #[default]
    Online,
    /// Ignore reachability entirely. Also disables refetch-on-reconnect.
    Always,
    /// Attempt once regardless of reachability, then pause retries while offline.
    OfflineFirst,
}

impl NetworkMode {
    /// Returns `true` if a cycle should pause before its first attempt when offline.
    #[must_use]
    pub const fn pauses_before_fetch(self) -> bool {
        matches!(self, Self::Online)
    }

    /// Returns `true` if retries (and in-flight attempts) pause when offline.
    #[must_use]
    pub const fn pauses_retries(self) -> bool {
        !matches!(self, Self::Always)
    }
}

/// Client-wide defaults for query behavior.
///
/// Every field can be overridden per instance through
/// [`QueryOptions`](crate::QueryOptions).
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, queries will refetch in the background while still showing cached data.
    pub stale_time: Duration,

    /// Number of retries after the initial attempt. `None` disables bounded retries.
    pub retry: Option<u32>,

    /// Upper bound for the default exponential retry delay.
    pub max_retry_delay: Duration,

    pub network_mode: NetworkMode,

    /// Refetch stale data when reachability comes back.
    pub refetch_on_reconnect: bool,

    /// Refetch stale data when the window regains focus.
    pub refetch_on_window_focus: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0), // immediately stale
            retry: Some(3),
            max_retry_delay: Duration::from_secs(30),
            network_mode: NetworkMode::Online,
            refetch_on_reconnect: true,
            refetch_on_window_focus: true,
        }
    }
}

impl QueryConfig {
    /// Creates a configuration with the given stale time and default everything else.
    #[must_use]
    pub const fn new(stale_time: Duration) -> Self {
        Self {
            stale_time,
            retry: Some(3),
            max_retry_delay: Duration::from_secs(30),
            network_mode: NetworkMode::Online,
            refetch_on_reconnect: true,
            refetch_on_window_focus: true,
        }
    }
}
