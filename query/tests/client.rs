mod common;

use std::time::Duration;

use common::{count, counter, counting_query, settle, slow_query};
use fibre_query::{
  query_key, CancelOptions, FetchStatus, InvalidateOptions, QueryClient, QueryConfig, QueryError, QueryFilters, QueryObserver,
  QueryOptions, QueryStatus, RefetchOptions, RefetchType, SetDataOptions,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_queries_data_by_prefix() {
  let client = QueryClient::new();
  client.set_query_data(query_key!["todos", 1], 10u32).unwrap();
  client.set_query_data(query_key!["todos", 2], 20u32).unwrap();
  client.set_query_data(query_key!["posts", 1], 30u32).unwrap();

  let values: Vec<u32> = client
    .get_queries_data::<u32>("todos")
    .into_iter()
    .filter_map(|(_, data)| data.map(|data| *data))
    .collect();
  assert_eq!(values, vec![10, 20]);

  let written = client.set_queries_data::<u32>("todos", |old| old.map(|n| n + 1));
  assert_eq!(written.len(), 2);
  assert_eq!(client.get_query_data::<u32>(query_key!["todos", 1]).as_deref(), Some(&11));
  assert_eq!(client.get_query_data::<u32>(query_key!["todos", 2]).as_deref(), Some(&21));
  assert_eq!(client.get_query_data::<u32>(query_key!["posts", 1]).as_deref(), Some(&30));
}

#[tokio::test]
async fn test_updater_returning_none_leaves_cache_alone() {
  let client = QueryClient::new();
  let written = client
    .set_query_data_with::<u32>("untouched", |_| None, SetDataOptions::default())
    .unwrap();
  assert!(written.is_none());
  assert!(client.query_cache().is_empty());

  client.set_query_data("counter", 1u32).unwrap();
  let written = client
    .set_query_data_with::<u32>("counter", |old| old.map(|n| n * 5), SetDataOptions::default())
    .unwrap();
  assert_eq!(written.as_deref(), Some(&5));
}

#[tokio::test]
async fn test_explicit_updated_at_is_recorded() {
  let client = QueryClient::new();
  client
    .set_query_data_with::<u32>(
      "dated",
      |_| Some(1),
      SetDataOptions {
        updated_at: Some(1_000),
        ..Default::default()
      },
    )
    .unwrap();
  let state = client.get_query_state::<u32>("dated").unwrap();
  assert_eq!(state.data_updated_at, 1_000);
  assert_eq!(state.status, QueryStatus::Success);
}

#[tokio::test]
async fn test_remove_queries_by_prefix() {
  let client = QueryClient::new();
  client.set_query_data(query_key!["todos", 1], 1u32).unwrap();
  client.set_query_data(query_key!["todos", 2], 2u32).unwrap();
  client.set_query_data("other", 3u32).unwrap();

  client.remove_queries("todos");
  assert_eq!(client.query_cache().len(), 1);
  assert!(client.get_query_data::<u32>("other").is_some());
}

#[tokio::test]
async fn test_reset_restores_initial_state() {
  let client = QueryClient::new();
  let options = client.default_query_options(QueryOptions::<u32>::new("reset").initial_data(1));
  client.query_cache().build(&options, None).unwrap();

  client.set_query_data("reset", 5u32).unwrap();
  assert_eq!(client.get_query_data::<u32>("reset").as_deref(), Some(&5));

  client.reset_queries("reset", RefetchOptions::default()).await.unwrap();
  assert_eq!(client.get_query_data::<u32>("reset").as_deref(), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_to_previous_data() {
  let client = QueryClient::new();
  client.set_query_data("cancel", 1u32).unwrap();

  let calls = counter();
  let fetch = tokio::spawn(client.fetch_query(slow_query("cancel", 2, Duration::from_millis(100), calls)));
  settle().await;
  assert_eq!(client.is_fetching("cancel"), 1);

  client.cancel_queries("cancel").await;

  let outcome = fetch.await.unwrap();
  assert!(matches!(outcome, Err(QueryError::Cancelled(_))));
  let state = client.get_query_state::<u32>("cancel").unwrap();
  assert_eq!(state.data.as_deref(), Some(&1));
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert!(state.error.is_none());

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(client.get_query_data::<u32>("cancel").as_deref(), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_silent_cancel_goes_idle_and_lets_gc_run() {
  let client = QueryClient::new();
  let calls = counter();
  let options = slow_query("silent", 2, Duration::from_millis(100), calls).cache_time(Duration::from_secs(1));
  let fetch = tokio::spawn(client.fetch_query(options));
  settle().await;

  client.cancel_queries_with("silent", CancelOptions::silent()).await;

  assert!(matches!(fetch.await.unwrap(), Err(QueryError::Cancelled(_))));
  let state = client.get_query_state::<u32>("silent").unwrap();
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(client.is_fetching("silent"), 0);

  tokio::time::sleep(Duration::from_secs(2)).await;
  assert!(client.get_query_state::<u32>("silent").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refetch_skips_disabled_queries() {
  let client = QueryClient::new();
  let disabled_calls = counter();
  let enabled_calls = counter();

  let observer = QueryObserver::new(
    &client,
    counting_query("disabled", 1, disabled_calls.clone()).enabled(false),
  )
  .unwrap();
  observer.subscribe(|_| {});
  client
    .fetch_query(counting_query("enabled", 2, enabled_calls.clone()))
    .await
    .unwrap();

  client
    .refetch_queries(QueryFilters::new(), RefetchOptions::default())
    .await
    .unwrap();
  assert_eq!(count(&disabled_calls), 0);
  assert_eq!(count(&enabled_calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_active_queries_only() {
  let client = QueryClient::new();
  let active_calls = counter();
  let inactive_calls = counter();

  let observer = QueryObserver::new(
    &client,
    counting_query(query_key!["items", "active"], 1, active_calls.clone()).stale_time(Duration::MAX),
  )
  .unwrap();
  observer.subscribe(|_| {});
  client
    .fetch_query(counting_query(query_key!["items", "inactive"], 2, inactive_calls.clone()))
    .await
    .unwrap();
  settle().await;

  client
    .invalidate_queries("items", InvalidateOptions::default())
    .await
    .unwrap();

  assert_eq!(count(&active_calls), 2);
  assert_eq!(count(&inactive_calls), 1);
  let inactive = client.get_query_state::<u32>(query_key!["items", "inactive"]).unwrap();
  assert!(inactive.is_invalidated);
  let active = client.get_query_state::<u32>(query_key!["items", "active"]).unwrap();
  assert!(!active.is_invalidated, "A successful refetch clears the flag");
}

#[tokio::test]
async fn test_invalidate_without_refetch() {
  let client = QueryClient::new();
  let calls = counter();
  client.fetch_query(counting_query("marked", 1, calls.clone())).await.unwrap();

  client
    .invalidate_queries(
      "marked",
      InvalidateOptions {
        refetch_type: RefetchType::None,
        ..Default::default()
      },
    )
    .await
    .unwrap();
  assert_eq!(count(&calls), 1);
  assert!(client.get_query_state::<u32>("marked").unwrap().is_invalidated);
}

#[tokio::test]
async fn test_ensure_query_data_prefers_the_cache() {
  let client = QueryClient::new();
  let calls = counter();
  client.set_query_data("cached", 4u32).unwrap();

  let cached = client.ensure_query_data(counting_query("cached", 9, calls.clone())).await.unwrap();
  assert_eq!(*cached, 4);
  assert_eq!(count(&calls), 0);

  let fetched = client.ensure_query_data(counting_query("missing", 9, calls.clone())).await.unwrap();
  assert_eq!(*fetched, 9);
  assert_eq!(count(&calls), 1);
}

#[tokio::test]
async fn test_query_defaults_apply_by_key_prefix() {
  let client = QueryClient::new();
  client.set_query_defaults(
    "scoped",
    QueryConfig {
      stale_time: Some(Duration::from_secs(60)),
      ..Default::default()
    },
  );
  let calls = counter();

  client.fetch_query(counting_query(query_key!["scoped", 1], 1, calls.clone())).await.unwrap();
  client.fetch_query(counting_query(query_key!["scoped", 1], 1, calls.clone())).await.unwrap();
  assert_eq!(count(&calls), 1, "The scoped stale time keeps the data fresh");

  client.fetch_query(counting_query("unscoped", 1, calls.clone())).await.unwrap();
  client.fetch_query(counting_query("unscoped", 1, calls.clone())).await.unwrap();
  assert_eq!(count(&calls), 3);
}

#[tokio::test]
async fn test_prefetch_swallows_errors() {
  let client = QueryClient::new();
  client.prefetch_query(QueryOptions::<u32>::new("absent")).await;
  assert!(client.get_query_data::<u32>("absent").is_none());
}

#[tokio::test]
async fn test_clear_empties_both_caches() {
  let client = QueryClient::new();
  client.set_query_data("a", 1u32).unwrap();
  client.clear();
  assert!(client.query_cache().is_empty());
  assert!(client.mutation_cache().is_empty());
}
