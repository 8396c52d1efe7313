mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{count, counter, failing_query};
use fibre_query::{QueryClient, QueryError, QueryOptions, QueryStatus, Retry, RetryDelay};
use parking_lot::Mutex;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_between_attempts() {
  let client = QueryClient::new();
  let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
  let options = QueryOptions::<u32>::new("backoff")
    .retry(3u32)
    .query_fn({
      let attempts = attempts.clone();
      move |_| {
        attempts.lock().push(Instant::now());
        async move { Err(QueryError::fetch("unavailable")) }
      }
    });

  let result = client.fetch_query(options).await;
  assert!(result.is_err());

  let attempts = attempts.lock().clone();
  assert_eq!(attempts.len(), 4, "One call plus three retries");
  let gaps: Vec<u128> = attempts
    .windows(2)
    .map(|pair| pair[1].duration_since(pair[0]).as_millis())
    .collect();
  for (gap, expected) in gaps.iter().zip([1000u128, 2000, 4000]) {
    assert!(
      *gap >= expected && *gap < expected + 50,
      "gap {gap}ms should be about {expected}ms"
    );
  }

  let state = client.get_query_state::<u32>("backoff").unwrap();
  assert_eq!(state.status, QueryStatus::Error);
  assert_eq!(state.failure_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failure_count_is_visible_while_retrying() {
  let client = QueryClient::new();
  let calls = counter();
  let options = failing_query("visible", calls.clone())
    .retry(2u32)
    .retry_delay(Duration::from_millis(100));

  let fetch = tokio::spawn(client.fetch_query(options));
  tokio::time::sleep(Duration::from_millis(50)).await;

  let state = client.get_query_state::<u32>("visible").unwrap();
  assert_eq!(state.failure_count, 1);
  assert!(state.failure_reason.is_some());
  assert!(state.error.is_none(), "Error is only set once retries are exhausted");
  assert_eq!(state.status, QueryStatus::Pending);

  assert!(fetch.await.unwrap().is_err());
  assert_eq!(count(&calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_predicate_decides() {
  let client = QueryClient::new();
  let calls = counter();
  let options = failing_query("predicate", calls.clone())
    .retry(Retry::when(|failure_count, error| {
      failure_count < 1 && matches!(error, QueryError::Fetch(_))
    }))
    .retry_delay(RetryDelay::Fixed(Duration::from_millis(5)));

  assert!(client.fetch_query(options).await.is_err());
  assert_eq!(count(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
  let client = QueryClient::new();
  let calls = Arc::new(AtomicUsize::new(0));
  let options = QueryOptions::new("flaky")
    .retry(Retry::Always)
    .retry_delay(RetryDelay::custom(|failure_count, _| {
      Duration::from_millis(10 * u64::from(failure_count + 1))
    }))
    .query_fn({
      let calls = calls.clone();
      move |_| {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if attempt < 2 {
            Err(QueryError::network("reset"))
          } else {
            Ok(42u32)
          }
        }
      }
    });

  let value = client.fetch_query(options).await.unwrap();
  assert_eq!(*value, 42);
  assert_eq!(calls.load(Ordering::SeqCst), 3);

  let state = client.get_query_state::<u32>("flaky").unwrap();
  assert_eq!(state.failure_count, 0, "Success clears the failure count");
  assert!(state.failure_reason.is_none());
}
