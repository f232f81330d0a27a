// Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use freshen::{QueryContext, QueryError};
use futures::future::BoxFuture;

/// Polls `condition` until it holds. Time auto-advances in paused tests.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(300), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

pub fn count(calls: &AtomicU32) -> u32 {
    calls.load(Ordering::SeqCst)
}

/// Succeeds with the 1-based call number.
pub fn counting(
    calls: &Arc<AtomicU32>,
) -> impl Fn(QueryContext) -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_ctx| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(call) })
    }
}

/// Fails the first `failures` calls, then succeeds with the call number.
pub fn failing_then_ok(
    calls: &Arc<AtomicU32>,
    failures: u32,
) -> impl Fn(QueryContext) -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_ctx| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if call <= failures {
                Err(QueryError::FetchError(format!("attempt {call} failed")))
            } else {
                Ok(call)
            }
        })
    }
}

/// Never settles on the first call, succeeds with the call number afterwards.
pub fn hanging_first(
    calls: &Arc<AtomicU32>,
) -> impl Fn(QueryContext) -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_ctx| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if call == 1 {
                futures::future::pending::<()>().await;
            }
            Ok(call)
        })
    }
}
