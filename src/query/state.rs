use tokio::time::Instant;

use crate::error::QueryError;

/// Overall status of a query, derived from its data and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data yet.
    Pending,
    /// The last cycle ended in a terminal error. Data may still be present.
    Error,
    /// Data is available.
    Success,
}

/// Fetch activity of a query instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    /// Waiting for reachability to come back.
    Paused,
}

/// A snapshot of a query instance's observable state.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    /// Last known value: fetched, cached, initial or placeholder.
    pub data: Option<T>,
    /// Fetch time of `data` when it came from the cache store.
    pub data_updated_at: Option<Instant>,
    /// Terminal error of the last cycle.
    pub error: Option<QueryError>,
    pub fetch_status: FetchStatus,
    /// Failed attempts in the current fetch cycle.
    pub failure_count: u32,
    /// Error of the most recent failed attempt, visible while retries are pending.
    pub failure_reason: Option<QueryError>,
    pub is_fetching_background: bool,
    pub is_placeholder_data: bool,
    pub is_refetch_error: bool,
}

impl<T> Default for QueryResult<T> {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            error: None,
            fetch_status: FetchStatus::Idle,
            failure_count: 0,
            failure_reason: None,
            is_fetching_background: false,
            is_placeholder_data: false,
            is_refetch_error: false,
        }
    }
}

impl<T> QueryResult<T> {
    /// An error always wins over stale data.
    pub const fn status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_none() {
            QueryStatus::Pending
        } else {
            QueryStatus::Success
        }
    }

    /// Returns the data if present.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status(), QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status(), QueryStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status(), QueryStatus::Error)
    }

    /// Returns `true` for a first load that is fetching or paused.
    pub const fn is_loading(&self) -> bool {
        self.is_pending()
            && matches!(self.fetch_status, FetchStatus::Fetching | FetchStatus::Paused)
    }

    pub const fn is_fetching(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Fetching)
    }

    pub const fn is_paused(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_result_data() {
        let result = QueryResult {
            data: Some(42),
            ..QueryResult::default()
        };
        assert_eq!(result.data(), Some(&42));

        let result: QueryResult<i32> = QueryResult::default();
        assert_eq!(result.data(), None);
    }

    #[test]
    fn test_status_derivation() {
        let pending: QueryResult<i32> = QueryResult::default();
        assert_eq!(pending.status(), QueryStatus::Pending);

        let success = QueryResult {
            data: Some(1),
            ..QueryResult::default()
        };
        assert_eq!(success.status(), QueryStatus::Success);

        let stale_with_error = QueryResult {
            data: Some(1),
            error: Some(QueryError::FetchError("boom".into())),
            ..QueryResult::default()
        };
        assert_eq!(stale_with_error.status(), QueryStatus::Error);
        assert_eq!(stale_with_error.data(), Some(&1));
    }

    #[test]
    fn test_query_result_predicates() {
        let loading: QueryResult<i32> = QueryResult {
            fetch_status: FetchStatus::Fetching,
            ..QueryResult::default()
        };
        assert!(loading.is_loading());
        assert!(loading.is_pending());
        assert!(loading.is_fetching());
        assert!(!loading.is_success());
        assert!(!loading.is_error());

        let paused_first_load: QueryResult<i32> = QueryResult {
            fetch_status: FetchStatus::Paused,
            ..QueryResult::default()
        };
        assert!(paused_first_load.is_loading());
        assert!(paused_first_load.is_paused());

        let background = QueryResult {
            data: Some(42),
            fetch_status: FetchStatus::Fetching,
            is_fetching_background: true,
            ..QueryResult::default()
        };
        assert!(!background.is_loading());
        assert!(background.is_fetching());
        assert!(background.is_success());

        let idle_pending: QueryResult<i32> = QueryResult::default();
        assert!(!idle_pending.is_loading());
    }
}
