// Integration tests for retry behavior of fetch cycles.
// The retry policy itself is unit tested in src/query/retry.rs.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use color_eyre::Result;
use freshen::{FetchStatus, Query, QueryClient, QueryConfig, QueryError, QueryOptions, QueryStatus};
use tokio::time::Instant;

use common::{count, counting, eventually, failing_then_ok};

#[tokio::test(start_paused = true)]
async fn test_bounded_retry_attempts_four_times() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(
        QueryOptions::new("todos")
            .retry(3)
            .query_fn(failing_then_ok(&calls, u32::MAX)),
        client.clone(),
    )?;

    let started = Instant::now();
    query.fetch().await?;

    assert_eq!(count(&calls), 4);
    let result = query.result();
    assert_eq!(result.status(), QueryStatus::Error);
    assert_eq!(result.fetch_status, FetchStatus::Idle);
    assert_eq!(result.failure_count, 4);
    assert_eq!(result.error, Some(QueryError::FetchError("attempt 4 failed".into())));
    assert_eq!(result.failure_reason, result.error);
    assert!(!result.is_refetch_error);
    assert_eq!(client.is_fetching(), 0);

    // 1s + 2s + 4s of exponential backoff.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_client_default_retry_count() -> Result<()> {
    let config = QueryConfig {
        retry: Some(1),
        ..QueryConfig::default()
    };
    let client = Arc::new(QueryClient::with_config(config));
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(
        QueryOptions::new("todos").query_fn(failing_then_ok(&calls, u32::MAX)),
        client,
    )?;

    query.fetch().await?;
    assert_eq!(count(&calls), 2);
    assert!(query.result().is_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_infinite_retry_until_success() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(
        QueryOptions::new("todos")
            .retry(0)
            .retry_infinite(true)
            .max_retry_delay(Duration::from_secs(5))
            .query_fn(failing_then_ok(&calls, 6)),
        client,
    )?;

    query.fetch().await?;

    let result = query.result();
    assert_eq!(result.failure_count, 6);
    assert!(result.error.is_none());
    assert!(result.failure_reason.is_none());
    assert_eq!(result.data, Some(7));
    assert_eq!(result.status(), QueryStatus::Success);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_retry() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(
        QueryOptions::new("todos")
            .no_retry()
            .query_fn(failing_then_ok(&calls, 1)),
        client,
    )?;

    query.fetch().await?;
    assert_eq!(count(&calls), 1);
    assert_eq!(query.result().failure_count, 1);
    assert!(query.result().is_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_predicate_after_count() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let query = Query::new(
        QueryOptions::new("todos")
            .retry(1)
            .retry_if({
                let seen = seen.clone();
                move |index: u32, error: &QueryError| {
                    seen.lock().unwrap().push(index);
                    index < 3 && matches!(error, QueryError::FetchError(_))
                }
            })
            .retry_delay(Duration::from_millis(100))
            .query_fn(failing_then_ok(&calls, u32::MAX)),
        client,
    )?;

    query.fetch().await?;

    // Index 0 is covered by the count, 1 and 2 by the predicate, 3 stops.
    assert_eq!(count(&calls), 4);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fixed_and_custom_delays() -> Result<()> {
    let client = Arc::new(QueryClient::new());

    let calls = Arc::new(AtomicU32::new(0));
    let fixed = Query::new(
        QueryOptions::new("fixed")
            .retry(2)
            .retry_delay(Duration::from_millis(500))
            .query_fn(failing_then_ok(&calls, u32::MAX)),
        client.clone(),
    )?;
    let started = Instant::now();
    fixed.fetch().await?;
    assert_eq!(started.elapsed(), Duration::from_millis(1000));

    let calls = Arc::new(AtomicU32::new(0));
    let custom = Query::new(
        QueryOptions::new("custom")
            .retry(3)
            .retry_delay_fn(|index: u32, _: &QueryError| {
                Duration::from_millis(100 * u64::from(index + 1))
            })
            .query_fn(failing_then_ok(&calls, u32::MAX)),
        client,
    )?;
    let started = Instant::now();
    custom.fetch().await?;
    assert_eq!(started.elapsed(), Duration::from_millis(600));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failure_reason_visible_while_retrying() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Arc::new(Query::new(
        QueryOptions::new("todos")
            .retry_delay(Duration::from_secs(10))
            .query_fn(failing_then_ok(&calls, 1)),
        client,
    )?);

    let fetch = tokio::spawn({
        let query = query.clone();
        async move { query.fetch().await }
    });
    eventually(|| query.result().failure_count == 1).await;

    let retrying = query.result();
    assert_eq!(retrying.fetch_status, FetchStatus::Fetching);
    assert!(retrying.failure_reason.is_some());
    assert!(retrying.error.is_none());
    assert!(retrying.is_loading());

    fetch.await??;
    let result = query.result();
    assert_eq!(result.data, Some(2));
    assert_eq!(result.failure_count, 1);
    assert!(result.failure_reason.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refetch_error_keeps_data() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let options = {
        let calls = calls.clone();
        QueryOptions::new("todos").no_retry().query_fn(move |_ctx| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if call == 1 {
                    Ok(call)
                } else {
                    Err(QueryError::NetworkError("connection reset".into()))
                }
            })
        })
    };
    let query = Query::new(options, client)?;

    query.fetch().await?;
    query.fetch().await?;

    let result = query.result();
    assert_eq!(result.status(), QueryStatus::Error);
    assert!(result.is_refetch_error);
    assert_eq!(result.data, Some(1), "cached data is retained");

    query.refetch().await?;
    assert!(query.result().is_refetch_error);
    assert_eq!(count(&calls), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_initial_load_error_is_not_refetch_error() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(
        QueryOptions::new("todos")
            .no_retry()
            .query_fn(failing_then_ok(&calls, 1)),
        client,
    )?;

    query.fetch().await?;
    let result = query.result();
    assert!(result.is_error());
    assert!(!result.is_refetch_error);
    assert!(result.data.is_none());

    // The next successful cycle clears the error.
    query.fetch().await?;
    let result = query.result();
    assert!(result.is_success());
    assert!(result.error.is_none());
    assert_eq!(result.failure_count, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_new_request_interrupts_retry_delay() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Arc::new(Query::new(
        QueryOptions::new("todos")
            .retry_delay(Duration::from_secs(60))
            .query_fn(failing_then_ok(&calls, 1)),
        client,
    )?);

    let first = tokio::spawn({
        let query = query.clone();
        async move { query.fetch().await }
    });
    eventually(|| query.result().failure_count == 1).await;

    let started = Instant::now();
    query.fetch().await?;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(first.await?, Err(QueryError::Cancelled));
    assert_eq!(query.result().data, Some(2));
    assert_eq!(query.result().failure_count, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_with_counting_fn() -> Result<()> {
    let client = Arc::new(QueryClient::new());
    let calls = Arc::new(AtomicU32::new(0));
    let query = Query::new(QueryOptions::new("todos").query_fn(counting(&calls)), client)?;

    query.fetch().await?;
    assert_eq!(query.result().failure_count, 0);
    assert_eq!(query.result().data, Some(1));
    Ok(())
}
