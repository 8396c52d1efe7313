#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibre_query::{QueryError, QueryKey, QueryOptions};

pub fn counter() -> Arc<AtomicUsize> {
  Arc::new(AtomicUsize::new(0))
}

pub fn count(calls: &Arc<AtomicUsize>) -> usize {
  calls.load(Ordering::SeqCst)
}

// A query that resolves to `value` and counts its invocations.
pub fn counting_query(key: impl Into<QueryKey>, value: u32, calls: Arc<AtomicUsize>) -> QueryOptions<u32> {
  QueryOptions::new(key).query_fn(move |_| {
    calls.fetch_add(1, Ordering::SeqCst);
    async move { Ok(value) }
  })
}

// Like `counting_query`, but each call takes `delay` to resolve.
pub fn slow_query(
  key: impl Into<QueryKey>,
  value: u32,
  delay: Duration,
  calls: Arc<AtomicUsize>,
) -> QueryOptions<u32> {
  QueryOptions::new(key).query_fn(move |_| {
    calls.fetch_add(1, Ordering::SeqCst);
    async move {
      tokio::time::sleep(delay).await;
      Ok(value)
    }
  })
}

// A query that always fails.
pub fn failing_query(key: impl Into<QueryKey>, calls: Arc<AtomicUsize>) -> QueryOptions<u32> {
  QueryOptions::new(key).query_fn(move |_| {
    calls.fetch_add(1, Ordering::SeqCst);
    async move { Err(QueryError::fetch("boom")) }
  })
}

// Lets spawned fetches and timers run. Only meaningful with a paused clock.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(10)).await;
}
