mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{count, counter, counting_query, settle, slow_query};
use fibre_query::{
  FetchStatus, QueryClient, QueryObserver, QueryObserverOptions, QueryStatus, RefetchOptions, ResultField,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[tokio::test(start_paused = true)]
async fn test_subscribe_fetches_and_notifies() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueryObserver::new(&client, counting_query("mount", 9, calls.clone())).unwrap();

  let seen: Arc<Mutex<Vec<(QueryStatus, FetchStatus)>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  observer.subscribe(move |result| sink.lock().push((result.status, result.fetch_status)));
  settle().await;

  assert_eq!(count(&calls), 1);
  let result = observer.current_result();
  assert_eq!(result.data.as_deref(), Some(&9));
  assert!(result.is_success());
  assert!(result.is_fetched_after_mount);
  assert_eq!(
    seen.lock().last().copied(),
    Some((QueryStatus::Success, FetchStatus::Idle))
  );
  assert!(seen.lock().contains(&(QueryStatus::Pending, FetchStatus::Fetching)));
}

#[tokio::test(start_paused = true)]
async fn test_observer_without_listeners_stays_idle() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueryObserver::new(&client, counting_query("lazy", 1, calls.clone())).unwrap();
  settle().await;

  assert_eq!(count(&calls), 0);
  assert!(observer.current_result().is_pending());
  assert!(!observer.has_listeners());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_observer_does_not_fetch() {
  let client = QueryClient::new();
  let calls = counter();
  let observer = QueryObserver::new(&client, counting_query("disabled", 1, calls.clone()).enabled(false)).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  assert_eq!(count(&calls), 0);
  let result = observer.current_result();
  assert_eq!(result.status, QueryStatus::Pending);
  assert_eq!(result.fetch_status, FetchStatus::Idle);

  let refetched = observer.refetch(RefetchOptions::default()).await.unwrap();
  assert_eq!(count(&calls), 1, "An explicit refetch ignores `enabled`");
  assert_eq!(refetched.data.as_deref(), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_select_maps_data() {
  let client = QueryClient::new();
  let calls = counter();
  let options = QueryObserverOptions::from(counting_query("selected", 21, calls.clone())).select(|n: &u32| n * 2);
  let observer = QueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  assert_eq!(observer.current_result().data.as_deref(), Some(&42));
  assert_eq!(client.get_query_data::<u32>("selected").as_deref(), Some(&21));
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_data_until_first_fetch() {
  let client = QueryClient::new();
  let calls = counter();
  let options = QueryObserverOptions::from(slow_query("placeholder", 5, Duration::from_millis(100), calls.clone()))
    .placeholder_data(1);
  let observer = QueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});

  let early = observer.current_result();
  assert!(early.is_placeholder_data);
  assert_eq!(early.status, QueryStatus::Success);
  assert_eq!(early.data.as_deref(), Some(&1));
  assert!(client.get_query_data::<u32>("placeholder").is_none());

  tokio::time::sleep(Duration::from_millis(150)).await;
  let late = observer.current_result();
  assert!(!late.is_placeholder_data);
  assert_eq!(late.data.as_deref(), Some(&5));
}

#[tokio::test(start_paused = true)]
async fn test_result_turns_stale_after_stale_time() {
  let client = QueryClient::new();
  let calls = counter();
  let options = counting_query("staleness", 1, calls.clone()).stale_time(Duration::from_secs(1));
  let observer = QueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});
  settle().await;
  assert!(!observer.current_result().is_stale);

  tokio::time::sleep(Duration::from_millis(1100)).await;
  assert!(observer.current_result().is_stale);
  assert_eq!(count(&calls), 1, "Going stale alone does not refetch");
}

#[tokio::test(start_paused = true)]
async fn test_refetch_interval_polls() {
  let client = QueryClient::new();
  let calls = counter();
  let options = counting_query("poll", 1, calls.clone())
    .refetch_interval(Duration::from_secs(1))
    .refetch_interval_in_background(true);
  let observer = QueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});
  settle().await;
  assert_eq!(count(&calls), 1);

  tokio::time::sleep(Duration::from_millis(3050)).await;
  assert_eq!(count(&calls), 4);

  observer.destroy();
  tokio::time::sleep(Duration::from_secs(3)).await;
  assert_eq!(count(&calls), 4, "Destroying the observer stops polling");
}

#[tokio::test(start_paused = true)]
async fn test_tracked_fields_filter_notifications() {
  let client = QueryClient::new();
  let calls = counter();
  let options = counting_query("tracked", 1, calls.clone()).stale_time(Duration::from_secs(1));
  let observer = QueryObserver::new(&client, options).unwrap();

  let notified = counter();
  let sink = notified.clone();
  observer.subscribe(move |_| {
    sink.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
  });
  settle().await;

  let tracked = observer.track_result(observer.current_result());
  assert_eq!(tracked.data().map(|data| **data), Some(1));
  let before = count(&notified);

  // Only `is_stale` changes here, which nobody read.
  tokio::time::sleep(Duration::from_millis(1100)).await;
  assert!(observer.current_result().is_stale);
  assert_eq!(count(&notified), before);

  let _ = tracked.is_stale();
  client.set_query_data("tracked", 2u32).unwrap();
  assert!(count(&notified) > before);
}

#[tokio::test(start_paused = true)]
async fn test_notify_on_listed_props_only() {
  let client = QueryClient::new();
  let calls = counter();
  let options = counting_query("props", 1, calls.clone())
    .notify_on_change_props(fibre_query::NotifyOnChangeProps::Props(vec![ResultField::Data]));
  let observer = QueryObserver::new(&client, options).unwrap();

  let notified = counter();
  let sink = notified.clone();
  observer.subscribe(move |_| {
    sink.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
  });
  settle().await;
  assert_eq!(count(&notified), 1, "Only the arrival of data is reported");
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribing_cancels_fetch_that_reads_the_signal() {
  let client = QueryClient::new();
  let options = fibre_query::QueryOptions::new("abortable").query_fn(|context| async move {
    let signal = context.signal();
    tokio::select! {
      _ = signal.cancelled() => Err(fibre_query::QueryError::fetch("aborted")),
      _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(1u32),
    }
  });
  let observer = QueryObserver::new(&client, options).unwrap();
  let id = observer.subscribe(|_| {});
  settle().await;
  assert!(observer.current_result().is_fetching());

  observer.unsubscribe(id);
  settle().await;
  let state = client.get_query_state::<u32>("abortable").unwrap();
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(state.status, QueryStatus::Pending);
  assert!(state.error.is_none(), "Cancellation never becomes an error");
}
