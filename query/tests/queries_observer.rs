mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{count, counter, counting_query, settle};
use fibre_query::{QueriesObserver, QueryClient, QueryOptions};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn fresh(key: &str, value: u32, calls: &Arc<std::sync::atomic::AtomicUsize>) -> QueryOptions<u32> {
  counting_query(key, value, calls.clone()).stale_time(Duration::from_secs(60))
}

#[tokio::test(start_paused = true)]
async fn test_results_follow_list_order() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueriesObserver::new(&client, vec![fresh("a", 1, &calls), fresh("b", 2, &calls)]).unwrap();

  let latest: Arc<Mutex<Vec<Option<u32>>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = latest.clone();
  observer.subscribe(move |results| {
    *sink.lock() = results.iter().map(|result| result.data.as_deref().copied()).collect();
  });
  settle().await;

  assert_eq!(count(&calls), 2);
  assert_eq!(*latest.lock(), vec![Some(1), Some(2)]);

  let data: Vec<_> = observer
    .current_result()
    .iter()
    .map(|result| result.data.as_deref().copied())
    .collect();
  assert_eq!(data, vec![Some(1), Some(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_reordering_reuses_observers() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueriesObserver::new(&client, vec![fresh("a", 1, &calls), fresh("b", 2, &calls)]).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  let before = observer.observers();
  observer
    .set_queries(vec![fresh("b", 2, &calls), fresh("a", 1, &calls)])
    .unwrap();
  settle().await;
  let after = observer.observers();

  assert!(Arc::ptr_eq(&before[0], &after[1]));
  assert!(Arc::ptr_eq(&before[1], &after[0]));
  assert_eq!(count(&calls), 2, "Fresh queries are not refetched when moved");

  let data: Vec<_> = observer
    .current_result()
    .iter()
    .map(|result| result.data.as_deref().copied())
    .collect();
  assert_eq!(data, vec![Some(2), Some(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_queries_lose_their_observer() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueriesObserver::new(&client, vec![fresh("a", 1, &calls), fresh("b", 2, &calls)]).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  observer
    .set_queries(vec![fresh("a", 1, &calls), fresh("c", 3, &calls)])
    .unwrap();
  settle().await;

  let observer_counts: Vec<usize> = ["a", "b", "c"]
    .into_iter()
    .map(|key| {
      client
        .query_cache()
        .find(key)
        .map(|query| query.observer_count())
        .unwrap_or_default()
    })
    .collect();
  assert_eq!(observer_counts, vec![1, 0, 1]);
  assert_eq!(count(&calls), 3);
}
