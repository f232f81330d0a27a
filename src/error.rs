//! Error type shared by the store and query instances.

use thiserror::Error;

use crate::key::QueryKey;

/// Error type for query operations.
///
/// Errors are `Clone` because the most recent one is kept in the observable
/// [`QueryResult`](crate::QueryResult) while also being handed to retry predicates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The fetch cycle was aborted by a newer request, a manual cancel,
    /// a cancellation broadcast or the caller's own token.
    #[error("Query was cancelled")]
    Cancelled,

    /// The query instance was disposed while the operation was outstanding.
    #[error("Query was disposed")]
    Disposed,

    #[error("No query function configured for key {key}")]
    MissingQueryFn { key: QueryKey },

    #[error("Invalid query configuration: {0}")]
    Config(String),

    #[error("Value cached under {key} is not a {expected}")]
    TypeMismatch {
        key: QueryKey,
        expected: &'static str,
    },
}

impl QueryError {
    /// Returns `true` if a failed attempt with this error may be retried.
    ///
    /// Misuse (configuration, type mismatch) and teardown never are.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Disposed
                | Self::MissingQueryFn { .. }
                | Self::Config(_)
                | Self::TypeMismatch { .. }
        )
    }
}
