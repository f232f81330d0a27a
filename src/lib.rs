//! # Freshen - asynchronous data synchronization
//!
//! Freshen keeps a cached, observable copy of remote resources fresh. A
//! [`Query`] is bound to a [`QueryKey`] and a fetch function; it reads and
//! writes a shared [`QueryClient`] store, refetches according to a staleness
//! policy, retries failures with backoff and coordinates its fetches with
//! network reachability and window focus.
//!
//! ## Core Components
//!
//! - [`QueryClient`]: The key-indexed cache store shared by all queries
//! - [`Query`]: One consumer's binding to a key, owning the fetch state machine
//! - [`QueryOptions`]: Per-query configuration, falling back to [`QueryConfig`]
//! - [`OnlineManager`] / [`FocusManager`]: Reachability and visibility sources
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use freshen::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! async fn fetch_user(id: i64) -> Result<User, QueryError> {
//!     Ok(User { id, name: "Ada".to_string() })
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = Arc::new(QueryClient::new());
//! let user = Query::new(
//!     QueryOptions::new(query_key!["user", 1]).query_fn(|_ctx| Box::pin(fetch_user(1))),
//!     client.clone(),
//! )?;
//!
//! user.fetch().await?;
//! let result = user.result();
//! assert_eq!(result.status(), QueryStatus::Success);
//! assert_eq!(result.data().map(|user| user.name.as_str()), Some("Ada"));
//!
//! // Going offline pauses fetches until reachability comes back.
//! client.online_manager().set_online(false);
//! user.refetch().await?;
//! assert_eq!(user.result().fetch_status, FetchStatus::Paused);
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Freshen emits [`tracing`] events (cycle transitions at `debug`, retries at
//! `warn`, terminal failures at `error`) and never installs a subscriber.

pub mod error;
pub mod focus;
pub mod key;
pub mod network;
pub mod prelude;
pub mod query;

pub use error::QueryError;
pub use focus::FocusManager;
pub use key::{KeyPart, QueryKey};
pub use network::OnlineManager;
pub use query::{
    CacheEntry, FetchStatus, NetworkMode, Query, QueryClient, QueryConfig, QueryContext,
    QueryOptions, QueryResult, QueryStatus, RetryPolicy,
};
