mod common;

use std::sync::Arc;
use std::time::Duration;

use common::settle;
use fibre_query::{
  FetchDirection, FetchPageOptions, InfiniteQueryObserver, InfiniteQueryOptions, QueryClient, QueryFunctionContext,
  RefetchOptions,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

type Seen = Arc<Mutex<Vec<(u32, Option<FetchDirection>)>>>;

fn seen() -> Seen {
  Arc::new(Mutex::new(Vec::new()))
}

// Page `n` holds `[n * 10, n * 10 + 1]`; pages run from 0 to 3.
fn numbers(key: &str, seen: Seen) -> InfiniteQueryOptions<Vec<u32>, u32> {
  InfiniteQueryOptions::new(key, 1)
    .query_fn(move |context: QueryFunctionContext<u32>| {
      seen.lock().push((context.page_param, context.direction));
      let page = context.page_param;
      async move { Ok(vec![page * 10, page * 10 + 1]) }
    })
    .get_next_page_param(|_, _, param, _| (*param < 3).then(|| param + 1))
    .get_previous_page_param(|_, _, param, _| (*param > 0).then(|| param - 1))
}

fn pages(observer: &InfiniteQueryObserver<Vec<u32>, u32>) -> Vec<Vec<u32>> {
  observer
    .current_result()
    .data
    .as_deref()
    .map(|data| data.pages.clone())
    .unwrap_or_default()
}

fn params(observer: &InfiniteQueryObserver<Vec<u32>, u32>) -> Vec<u32> {
  observer
    .current_result()
    .data
    .as_deref()
    .map(|data| data.page_params.clone())
    .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_pages_grow_in_both_directions() {
  let client = QueryClient::new();
  let calls = seen();
  let observer = InfiniteQueryObserver::new(&client, numbers("grow", calls.clone())).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  assert_eq!(pages(&observer), vec![vec![10, 11]]);
  assert!(observer.has_next_page());
  assert!(observer.has_previous_page());

  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  assert_eq!(params(&observer), vec![1, 2]);

  observer.fetch_previous_page(FetchPageOptions::default()).await.unwrap();
  assert_eq!(pages(&observer), vec![vec![0, 1], vec![10, 11], vec![20, 21]]);
  assert_eq!(params(&observer), vec![0, 1, 2]);
  assert!(!observer.has_previous_page());

  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  assert_eq!(params(&observer), vec![0, 1, 2, 3]);
  assert!(!observer.has_next_page());

  assert_eq!(
    *calls.lock(),
    vec![
      (1, Some(FetchDirection::Forward)),
      (2, Some(FetchDirection::Forward)),
      (0, Some(FetchDirection::Backward)),
      (3, Some(FetchDirection::Forward)),
    ]
  );
}

#[tokio::test(start_paused = true)]
async fn test_no_next_page_keeps_data() {
  let client = QueryClient::new();
  let calls = seen();
  let options = InfiniteQueryOptions::<Vec<u32>, u32>::new("last", 3)
    .query_fn({
      let calls = calls.clone();
      move |context: QueryFunctionContext<u32>| {
        calls.lock().push((context.page_param, context.direction));
        async move { Ok(vec![context.page_param]) }
      }
    })
    .get_next_page_param(|_, _, _, _| None);
  let observer = InfiniteQueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});
  settle().await;
  assert!(!observer.has_next_page());

  let before = observer.current_result().data.clone().unwrap();
  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  let after = observer.current_result().data.clone().unwrap();

  assert_eq!(calls.lock().len(), 1);
  assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_page_param_overrides_the_computed_one() {
  let client = QueryClient::new();
  let calls = seen();
  let observer = InfiniteQueryObserver::new(&client, numbers("explicit", calls)).unwrap();
  observer.subscribe(|_| {});
  settle().await;

  observer
    .fetch_next_page(FetchPageOptions {
      page_param: Some(7),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(params(&observer), vec![1, 7]);
  assert_eq!(pages(&observer), vec![vec![10, 11], vec![70, 71]]);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_reloads_every_page_in_order() {
  let client = QueryClient::new();
  let calls = seen();
  let observer = InfiniteQueryObserver::new(&client, numbers("refetch", calls.clone())).unwrap();
  observer.subscribe(|_| {});
  settle().await;
  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  calls.lock().clear();

  observer.refetch(RefetchOptions::default()).await.unwrap();

  let refetched: Vec<u32> = calls.lock().iter().map(|(param, _)| *param).collect();
  assert_eq!(refetched, vec![1, 2, 3]);
  assert_eq!(params(&observer), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_fetching_direction_is_reported() {
  let client = QueryClient::new();
  let options = InfiniteQueryOptions::<Vec<u32>, u32>::new("direction", 1)
    .query_fn(|context: QueryFunctionContext<u32>| async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(vec![context.page_param])
    })
    .get_next_page_param(|_, _, param, _| Some(param + 1))
    .get_previous_page_param(|_, _, param, _| param.checked_sub(1));
  let observer = InfiniteQueryObserver::new(&client, options).unwrap();
  observer.subscribe(|_| {});
  tokio::time::sleep(Duration::from_millis(100)).await;

  let next = observer.fetch_next_page(FetchPageOptions::default());
  assert!(observer.is_fetching_next_page());
  assert!(!observer.is_fetching_previous_page());
  next.await.unwrap();
  assert!(!observer.is_fetching_next_page());

  let previous = observer.fetch_previous_page(FetchPageOptions::default());
  assert!(observer.is_fetching_previous_page());
  previous.await.unwrap();
  assert_eq!(params(&observer), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_listener_follows_a_key_change() {
  let client = QueryClient::new();
  let observer = InfiniteQueryObserver::new(&client, numbers("before", seen())).unwrap();
  let flags = Arc::new(Mutex::new(Vec::new()));
  observer.subscribe({
    let flags = flags.clone();
    move |result| flags.lock().push(result.is_fetching_next_page)
  });
  settle().await;

  observer.set_options(numbers("after", seen())).unwrap();
  settle().await;
  flags.lock().clear();

  observer.fetch_next_page(FetchPageOptions::default()).await.unwrap();
  assert!(flags.lock().contains(&true));
  assert_eq!(flags.lock().last(), Some(&false));
  assert_eq!(params(&observer), vec![1, 2]);
}

#[tokio::test]
async fn test_fetch_infinite_query_loads_the_first_page() {
  let client = QueryClient::new();
  let data = client.fetch_infinite_query(numbers("client", seen())).await.unwrap();
  assert_eq!(data.pages, vec![vec![10, 11]]);
  assert_eq!(data.page_params, vec![1]);
}
