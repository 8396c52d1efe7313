mod common;

use std::time::Duration;

use common::{counter, counting_query, settle};
use fibre_query::{QueryClient, QueryObserver};

#[tokio::test(start_paused = true)]
async fn test_unused_query_is_collected_after_cache_time() {
  let client = QueryClient::new();
  let calls = counter();
  client
    .fetch_query(counting_query("short-lived", 1, calls).cache_time(Duration::from_secs(1)))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(900)).await;
  assert!(client.get_query_data::<u32>("short-lived").is_some());

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(client.get_query_data::<u32>("short-lived").is_none());
  assert!(client.query_cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_observed_query_survives_until_unsubscribed() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueryObserver::new(
    &client,
    counting_query("watched", 1, calls).cache_time(Duration::from_secs(1)),
  )
  .unwrap();
  let id = observer.subscribe(|_| {});
  settle().await;

  tokio::time::sleep(Duration::from_secs(5)).await;
  assert!(client.get_query_data::<u32>("watched").is_some());

  observer.unsubscribe(id);
  tokio::time::sleep(Duration::from_millis(500)).await;
  assert!(client.get_query_data::<u32>("watched").is_some());

  tokio::time::sleep(Duration::from_millis(600)).await;
  assert!(client.get_query_data::<u32>("watched").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_infinite_cache_time_is_never_collected() {
  let client = QueryClient::new();
  let calls = counter();
  client
    .fetch_query(counting_query("forever", 1, calls).cache_time(Duration::MAX))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
  assert!(client.get_query_data::<u32>("forever").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_written_data_uses_default_cache_time() {
  let client = QueryClient::new();
  client.set_query_data("written", 3u32).unwrap();

  tokio::time::sleep(Duration::from_secs(4 * 60)).await;
  assert!(client.get_query_data::<u32>("written").is_some());

  tokio::time::sleep(Duration::from_secs(2 * 60)).await;
  assert!(client.get_query_data::<u32>("written").is_none());
}
