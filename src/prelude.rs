//! Prelude module for convenient imports.
//!
//! ```
//! use freshen::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Query`] and [`QueryOptions`] - Binding to a key and configuring it
//! - [`QueryClient`] and [`QueryConfig`] - The shared store and its defaults
//! - [`QueryResult`], [`QueryStatus`], [`FetchStatus`] - Observable state
//! - [`QueryKey`] and [`query_key!`](crate::query_key) - Resource identity
//! - [`QueryError`] - The error type

pub use crate::error::QueryError;
pub use crate::key::QueryKey;
pub use crate::query::{
    FetchStatus, NetworkMode, Query, QueryClient, QueryConfig, QueryContext, QueryOptions,
    QueryResult, QueryStatus,
};
pub use crate::query_key;
