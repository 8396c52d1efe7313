mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{count, counter, settle};
use fibre_query::{
  CachedMutation, MutateOptions, MutationCacheConfig, MutationFilters, MutationObserver, MutationOptions,
  MutationStatus, QueryClient, QueryError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
  Arc::new(Mutex::new(Vec::new()))
}

fn times_ten() -> MutationOptions<u32, u32, String> {
  MutationOptions::new()
    .mutation_fn(|n: Arc<u32>| async move { Ok(*n * 10) })
    .on_mutate(|n: Arc<u32>| async move { Ok(format!("ctx-{n}")) })
}

#[tokio::test]
async fn test_mutate_runs_callbacks_with_context() {
  let client = QueryClient::new();
  let events = log();
  let options = times_ten()
    .on_success({
      let events = events.clone();
      move |data, variables, context| {
        events
          .lock()
          .push(format!("success {data} {variables} {}", context.cloned().unwrap_or_default()))
      }
    })
    .on_settled({
      let events = events.clone();
      move |data, error, _, _| events.lock().push(format!("settled {:?} {}", data, error.is_some()))
    });
  let observer = MutationObserver::new(&client, options);

  let data = observer
    .mutate_async(
      3,
      MutateOptions::new()
        .on_success({
          let events = events.clone();
          move |data, _, _| events.lock().push(format!("call success {data}"))
        })
        .on_settled({
          let events = events.clone();
          move |_, _, _, _| events.lock().push("call settled".to_string())
        }),
    )
    .await
    .unwrap();

  assert_eq!(*data, 30);
  assert_eq!(
    *events.lock(),
    vec![
      "success 30 3 ctx-3".to_string(),
      "settled Some(30) false".to_string(),
      "call success 30".to_string(),
      "call settled".to_string(),
    ]
  );

  let result = observer.current_result();
  assert_eq!(result.status(), MutationStatus::Success);
  assert_eq!(result.data().map(|data| **data), Some(30));
  assert_eq!(result.variables().map(|variables| **variables), Some(3));
  assert_eq!(result.state.context.as_deref().map(String::as_str), Some("ctx-3"));
}

#[tokio::test]
async fn test_cache_hooks_run_before_mutation_hooks() {
  let events = log();
  let config = MutationCacheConfig {
    on_mutate: Some(Arc::new({
      let events = events.clone();
      move |_: &dyn CachedMutation| events.lock().push("cache mutate".to_string())
    })),
    on_success: Some(Arc::new({
      let events = events.clone();
      move |_: &dyn CachedMutation| events.lock().push("cache success".to_string())
    })),
    on_settled: Some(Arc::new({
      let events = events.clone();
      move |_: Option<&QueryError>, _: &dyn CachedMutation| events.lock().push("cache settled".to_string())
    })),
    ..Default::default()
  };
  let client = QueryClient::builder().mutation_cache_config(config).build();

  let options = times_ten()
    .on_success({
      let events = events.clone();
      move |_, _, _| events.lock().push("mutation success".to_string())
    })
    .on_settled({
      let events = events.clone();
      move |_, _, _, _| events.lock().push("mutation settled".to_string())
    });
  MutationObserver::new(&client, options)
    .mutate_async(1, MutateOptions::new())
    .await
    .unwrap();

  assert_eq!(
    *events.lock(),
    vec!["cache mutate", "cache success", "mutation success", "cache settled", "mutation settled"]
  );
}

#[tokio::test]
async fn test_failed_mutation_reports_error() {
  let client = QueryClient::new();
  let events = log();
  let options = MutationOptions::<u32, u32>::new()
    .mutation_fn(|_| async move { Err(QueryError::fetch("rejected")) })
    .on_error({
      let events = events.clone();
      move |error, variables, context| {
        events
          .lock()
          .push(format!("error {error} {variables} {}", context.is_some()))
      }
    });
  let observer = MutationObserver::new(&client, options);

  let outcome = observer.mutate_async(7, MutateOptions::new()).await;
  assert!(outcome.is_err());
  assert_eq!(events.lock().len(), 1);
  assert!(events.lock()[0].starts_with("error "));
  assert!(events.lock()[0].ends_with(" 7 false"));

  let result = observer.current_result();
  assert!(result.is_error());
  assert!(result.error().is_some());
  assert!(result.data().is_none());
  assert_eq!(result.state.failure_count, 1);
}

#[tokio::test]
async fn test_failing_on_mutate_skips_the_mutation_fn() {
  let client = QueryClient::new();
  let calls = counter();
  let options = MutationOptions::<u32, u32, String>::new()
    .mutation_fn({
      let calls = calls.clone();
      move |n: Arc<u32>| {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Ok(*n) }
      }
    })
    .on_mutate(|_| async move { Err(QueryError::fetch("not allowed")) });
  let observer = MutationObserver::new(&client, options);

  assert!(observer.mutate_async(1, MutateOptions::new()).await.is_err());
  assert_eq!(count(&calls), 0);
  assert!(observer.current_result().is_error());
}

#[tokio::test(start_paused = true)]
async fn test_is_mutating_counts_pending_mutations() {
  let client = QueryClient::new();
  let options = MutationOptions::<u32, u32>::new()
    .mutation_key("save")
    .mutation_fn(|n: Arc<u32>| async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(*n)
    });
  let observer = MutationObserver::new(&client, options);

  observer.mutate(1, MutateOptions::new());
  assert_eq!(client.is_mutating(MutationFilters::new()), 1);
  assert_eq!(client.is_mutating("save"), 1);
  assert_eq!(client.is_mutating("other"), 0);
  assert!(observer.current_result().is_pending());

  tokio::time::sleep(Duration::from_millis(150)).await;
  assert_eq!(client.is_mutating(MutationFilters::new()), 0);
  assert!(observer.current_result().is_success());
}

#[tokio::test]
async fn test_find_all_filters_by_status() {
  let client = QueryClient::new();
  let ok = MutationObserver::new(&client, times_ten());
  ok.mutate_async(1, MutateOptions::new()).await.unwrap();
  let failing = MutationObserver::new(
    &client,
    MutationOptions::<u32, u32>::new().mutation_fn(|_| async move { Err(QueryError::fetch("rejected")) }),
  );
  assert!(failing.mutate_async(2, MutateOptions::new()).await.is_err());

  let cache = client.mutation_cache();
  assert_eq!(cache.find_all(MutationFilters::new()).len(), 2);
  let succeeded = cache.find_all(MutationFilters::new().status(MutationStatus::Success));
  assert_eq!(succeeded.len(), 1);
  assert_eq!(succeeded[0].status(), MutationStatus::Success);
  assert_eq!(cache.find_all(MutationFilters::new().status(MutationStatus::Error)).len(), 1);
  assert!(cache.find_all(MutationFilters::new().status(MutationStatus::Pending)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_the_latest_call_gets_its_callbacks() {
  let client = QueryClient::new();
  let options = MutationOptions::<u32, u64>::new().mutation_fn(|delay: Arc<u64>| async move {
    tokio::time::sleep(Duration::from_millis(*delay)).await;
    Ok(*delay as u32)
  });
  let observer = MutationObserver::new(&client, options);

  let first = counter();
  let second = counter();
  observer.mutate(
    100,
    MutateOptions::new().on_success({
      let first = first.clone();
      move |_, _, _| {
        first.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      }
    }),
  );
  observer.mutate(
    10,
    MutateOptions::new().on_success({
      let second = second.clone();
      move |_, _, _| {
        second.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      }
    }),
  );

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(count(&first), 0);
  assert_eq!(count(&second), 1);
  assert_eq!(observer.current_result().data().map(|data| **data), Some(10));
  assert_eq!(client.mutation_cache().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_retries_when_configured() {
  let client = QueryClient::new();
  let calls = counter();
  let options = MutationOptions::<u32, u32>::new()
    .retry(1u32)
    .retry_delay(Duration::from_millis(10))
    .mutation_fn({
      let calls = calls.clone();
      move |_| {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Err(QueryError::fetch("still failing")) }
      }
    });

  let outcome = MutationObserver::new(&client, options)
    .mutate_async(1, MutateOptions::new())
    .await;
  assert!(outcome.is_err());
  assert_eq!(count(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_finished_mutation_is_collected_after_cache_time() {
  let client = QueryClient::new();
  let options = MutationOptions::<u32, u32>::new()
    .cache_time(Duration::from_secs(1))
    .mutation_fn(|n: Arc<u32>| async move { Ok(*n) });
  let observer = MutationObserver::new(&client, options);
  observer.mutate_async(1, MutateOptions::new()).await.unwrap();
  assert_eq!(client.mutation_cache().len(), 1);

  drop(observer);
  settle().await;
  assert_eq!(client.mutation_cache().len(), 1);

  tokio::time::sleep(Duration::from_millis(1100)).await;
  assert!(client.mutation_cache().is_empty());
}

#[tokio::test]
async fn test_reset_returns_to_idle() {
  let client = QueryClient::new();
  let observer = MutationObserver::new(&client, times_ten());
  observer.mutate_async(2, MutateOptions::new()).await.unwrap();
  assert!(observer.current_result().is_success());

  observer.reset();
  let result = observer.current_result();
  assert!(result.is_idle());
  assert!(result.data().is_none());
  assert!(result.mutation_id.is_none());
}
