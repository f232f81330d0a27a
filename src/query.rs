//! Cached queries with staleness tracking and automatic refetching.
//!
//! This module provides the [`Query`] instance and the [`QueryClient`] store it
//! reads and writes, similar to SWR or TanStack Query.
//!
//! # Features
//!
//! - **Single flight**: one fetch cycle per instance, the newest request wins;
//!   instances sharing a key also share one in-flight fetch through the client
//! - **Staleness**: fresh cached data short-circuits fetches, stale data is
//!   refetched in the background while still displayed
//! - **Retries**: bounded, infinite or predicate-driven, with capped exponential backoff
//! - **Reachability**: fetches and retries pause while offline and resume on reconnect
//! - **Triggers**: focus regain, polling, invalidation and cancellation broadcasts
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use freshen::{Query, QueryClient, QueryConfig, QueryError, QueryOptions, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = Arc::new(QueryClient::with_config(QueryConfig::new(Duration::from_secs(30))));
//!
//! let todos = Query::new(
//!     QueryOptions::new(query_key!["todos"])
//!         .query_fn(|_ctx| {
//!             Box::pin(async { Ok::<_, QueryError>(vec!["write docs".to_string()]) })
//!         }),
//!     client.clone(),
//! )?;
//! todos.fetch().await?;
//! assert!(todos.result().is_success());
//!
//! // Fresh for 30 seconds: a second fetch is served from the cache.
//! assert!(!todos.is_stale());
//!
//! // Invalidation makes the entry stale and refetches bound queries.
//! client.invalidate(&query_key!["todos"]);
//! assert!(todos.is_stale());
//! # Ok(())
//! # }
//! ```

mod cache;
mod client;
mod config;
mod cycle;
mod instance;
mod listeners;
mod options;
mod retry;
mod signal;
mod state;

// Re-export main types
pub use cache::CacheEntry;
pub use client::{DefaultQueryFn, ErasedValue, KeySet, QueryClient};
pub use config::{NetworkMode, QueryConfig};
pub use instance::Query;
pub use listeners::{Listener, ListenerId};
pub use options::{InitialData, Meta, PlaceholderData, QueryContext, QueryFn, QueryOptions};
pub use retry::{RetryDelay, RetryDelayFn, RetryPolicy, RetryPredicate, exponential_delay};
pub use state::{FetchStatus, QueryResult, QueryStatus};
