mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{count, counter, counting_query, failing_query, slow_query};
use fibre_query::{query_key, FetchStatus, QueryClient, QueryOptions, QueryStatus};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_call() {
  let client = QueryClient::new();
  let calls = counter();
  let options = slow_query("todos", 7, Duration::from_millis(50), calls.clone());

  let first = client.fetch_query(options.clone());
  let second = client.fetch_query(options);
  let (first, second) = tokio::join!(first, second);

  let (first, second) = (first.unwrap(), second.unwrap());
  assert_eq!(*first, 7);
  assert!(Arc::ptr_eq(&first, &second), "Both callers should get the same value");
  assert_eq!(count(&calls), 1);
}

#[tokio::test]
async fn test_fetch_query_returns_fresh_cached_data() {
  let client = QueryClient::new();
  let calls = counter();
  let options = counting_query("fresh", 1, calls.clone()).stale_time(Duration::from_secs(60));

  let first = client.fetch_query(options.clone()).await.unwrap();
  let second = client.fetch_query(options).await.unwrap();

  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(count(&calls), 1, "Fresh data should not be refetched");
}

#[tokio::test]
async fn test_stale_data_is_refetched_and_shared() {
  let client = QueryClient::new();
  let calls = counter();
  let options = QueryOptions::new("list").query_fn({
    let calls = calls.clone();
    move |_| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok(vec![1, 2, 3]) }
    }
  });

  let first = client.fetch_query(options.clone()).await.unwrap();
  let second = client.fetch_query(options).await.unwrap();

  assert_eq!(count(&calls), 2);
  assert!(
    Arc::ptr_eq(&first, &second),
    "Equal data should keep the previous reference"
  );
}

#[tokio::test]
async fn test_hash_ignores_object_field_order() {
  let client = QueryClient::new();
  let a = query_key!["todos", { "page": 1, "done": false }];
  let b = query_key!["todos", { "done": false, "page": 1 }];
  assert_eq!(a.hash_key(), b.hash_key());

  client.set_query_data(a, 5u32).unwrap();
  assert_eq!(client.get_query_data::<u32>(b).as_deref(), Some(&5));
}

#[tokio::test]
async fn test_failed_fetch_records_error_state() {
  let client = QueryClient::new();
  let calls = counter();

  let result = client.fetch_query(failing_query("broken", calls.clone())).await;
  assert!(result.is_err());
  assert_eq!(count(&calls), 1, "fetch_query does not retry by default");

  let state = client.get_query_state::<u32>("broken").unwrap();
  assert_eq!(state.status, QueryStatus::Error);
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(state.error_update_count, 1);
  assert!(state.error.is_some());
  assert!(state.data.is_none());
}

#[tokio::test]
async fn test_missing_query_fn_is_an_error() {
  let client = QueryClient::new();
  let result = client.fetch_query(QueryOptions::<u32>::new("nothing")).await;
  assert!(matches!(result, Err(fibre_query::QueryError::MissingQueryFn(_))));
}

#[tokio::test]
async fn test_type_mismatch_on_same_key() {
  let client = QueryClient::new();
  client.set_query_data("shared", 1u32).unwrap();

  let result = client.set_query_data("shared", "text".to_string());
  assert!(matches!(result, Err(fibre_query::QueryError::TypeMismatch(_))));
  assert_eq!(client.get_query_data::<u32>("shared").as_deref(), Some(&1));
}

#[tokio::test]
async fn test_success_updates_counters() {
  let client = QueryClient::new();
  let calls = counter();
  client
    .fetch_query(counting_query("counted", 3, calls.clone()))
    .await
    .unwrap();

  let state = client.get_query_state::<u32>("counted").unwrap();
  assert_eq!(state.status, QueryStatus::Success);
  assert_eq!(state.data_update_count, 1);
  assert!(state.data_updated_at > 0);
  assert!(!state.is_invalidated);
}
