use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelOptions, QueryError};
use crate::key::QueryKey;
use crate::notify::notify_manager;
use crate::options::{
  FetchDirection, FetchMore, FetchOptions, QueryData, QueryFn, QueryFunctionContext, QueryOptions,
  SetDataOptions,
};
use crate::query_cache::{QueryCache, QueryCacheEvent};
use crate::removable::Removable;
use crate::retryer::{can_fetch, Retry, Retryer, RetryerConfig, RunFn, SharedResult};
use crate::runtime::TaskSpawner;
use crate::time::{now_millis, time_until_stale};

/// The shared result of one fetch. Every caller that joins an in-flight fetch
/// awaits the same future.
pub type QueryFuture<T> = SharedResult<Arc<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum QueryStatus {
  /// No data yet.
  Pending,
  Error,
  Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum FetchStatus {
  Fetching,
  /// Wanted to fetch but is waiting for focus or connectivity.
  Paused,
  Idle,
}

/// Extra information about the running fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchMeta {
  pub direction: Option<FetchDirection>,
}

/// The state of one query entry.
pub struct QueryState<T> {
  pub data: Option<Arc<T>>,
  pub data_update_count: u32,
  /// Milliseconds since the UNIX epoch; 0 when data was never set.
  pub data_updated_at: u64,
  pub error: Option<QueryError>,
  pub error_update_count: u32,
  pub error_updated_at: u64,
  pub failure_count: u32,
  pub failure_reason: Option<QueryError>,
  pub fetch_meta: Option<FetchMeta>,
  pub is_invalidated: bool,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
}

impl<T> Clone for QueryState<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      data_update_count: self.data_update_count,
      data_updated_at: self.data_updated_at,
      error: self.error.clone(),
      error_update_count: self.error_update_count,
      error_updated_at: self.error_updated_at,
      failure_count: self.failure_count,
      failure_reason: self.failure_reason.clone(),
      fetch_meta: self.fetch_meta,
      is_invalidated: self.is_invalidated,
      status: self.status,
      fetch_status: self.fetch_status,
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryState")
      .field("status", &self.status)
      .field("fetch_status", &self.fetch_status)
      .field("data", &self.data)
      .field("data_updated_at", &self.data_updated_at)
      .field("error", &self.error)
      .field("failure_count", &self.failure_count)
      .field("is_invalidated", &self.is_invalidated)
      .finish_non_exhaustive()
  }
}

impl<T> QueryState<T> {
  /// The state of a query with no data.
  pub fn pending() -> Self {
    Self {
      data: None,
      data_update_count: 0,
      data_updated_at: 0,
      error: None,
      error_update_count: 0,
      error_updated_at: 0,
      failure_count: 0,
      failure_reason: None,
      fetch_meta: None,
      is_invalidated: false,
      status: QueryStatus::Pending,
      fetch_status: FetchStatus::Idle,
    }
  }

  /// A successful state holding `data`, updated at `updated_at` (or now).
  pub fn with_data(data: Arc<T>, updated_at: Option<u64>) -> Self {
    Self {
      data: Some(data),
      data_updated_at: updated_at.unwrap_or_else(now_millis),
      status: QueryStatus::Success,
      ..Self::pending()
    }
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }
}

pub(crate) fn default_state<T>(options: &QueryOptions<T>) -> QueryState<T> {
  match options.initial_data.as_ref().and_then(|initial| initial.resolve()) {
    Some(data) => QueryState::with_data(data, options.initial_data_updated_at),
    None => QueryState::pending(),
  }
}

/// Keeps `prev` when `next` is equal to it, so unchanged data keeps its identity.
pub(crate) fn replace_data<T: PartialEq>(prev: Option<&Arc<T>>, next: Arc<T>, share: bool) -> Arc<T> {
  match prev {
    Some(prev) if share && (Arc::ptr_eq(prev, &next) || **prev == *next) => prev.clone(),
    _ => next,
  }
}

/// What kind of transition a query went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
  Failed,
  Fetch,
  Pause,
  Continue,
  Success { manual: bool },
  Error { cancelled: bool },
  Invalidate,
  SetState,
}

pub(crate) enum Action<T> {
  Failed { failure_count: u32, error: QueryError },
  Fetch { meta: Option<FetchMeta>, can_fetch: bool },
  Pause,
  Continue,
  Success { data: Arc<T>, updated_at: Option<u64>, manual: bool },
  Error { error: QueryError },
  Invalidate,
  SetState { state: QueryState<T> },
}

impl<T> Action<T> {
  fn kind(&self) -> ActionKind {
    match self {
      Action::Failed { .. } => ActionKind::Failed,
      Action::Fetch { .. } => ActionKind::Fetch,
      Action::Pause => ActionKind::Pause,
      Action::Continue => ActionKind::Continue,
      Action::Success { manual, .. } => ActionKind::Success { manual: *manual },
      Action::Error { error } => ActionKind::Error {
        cancelled: error.is_cancelled(),
      },
      Action::Invalidate => ActionKind::Invalidate,
      Action::SetState { .. } => ActionKind::SetState,
    }
  }
}

/// The single place query state changes.
pub(crate) fn reduce<T>(state: &QueryState<T>, action: Action<T>, revert: Option<&QueryState<T>>) -> QueryState<T> {
  match action {
    Action::Failed { failure_count, error } => QueryState {
      failure_count,
      failure_reason: Some(error),
      ..state.clone()
    },
    Action::Pause => QueryState {
      fetch_status: FetchStatus::Paused,
      ..state.clone()
    },
    Action::Continue => QueryState {
      fetch_status: FetchStatus::Fetching,
      ..state.clone()
    },
    Action::Fetch { meta, can_fetch } => {
      let mut next = QueryState {
        failure_count: 0,
        failure_reason: None,
        fetch_meta: meta,
        fetch_status: if can_fetch {
          FetchStatus::Fetching
        } else {
          FetchStatus::Paused
        },
        ..state.clone()
      };
      if state.data_updated_at == 0 {
        next.error = None;
        next.status = QueryStatus::Pending;
      }
      next
    }
    Action::Success {
      data,
      updated_at,
      manual,
    } => {
      let mut next = QueryState {
        data: Some(data),
        data_update_count: state.data_update_count + 1,
        data_updated_at: updated_at.unwrap_or_else(now_millis),
        error: None,
        is_invalidated: false,
        status: QueryStatus::Success,
        ..state.clone()
      };
      if !manual {
        next.fetch_status = FetchStatus::Idle;
        next.failure_count = 0;
        next.failure_reason = None;
      }
      next
    }
    Action::Error { error } => match error.as_cancelled() {
      Some(cancelled) => match revert {
        Some(revert) if cancelled.revert => QueryState {
          fetch_status: FetchStatus::Idle,
          ..revert.clone()
        },
        _ => QueryState {
          fetch_status: FetchStatus::Idle,
          ..state.clone()
        },
      },
      None => QueryState {
        error: Some(error.clone()),
        error_update_count: state.error_update_count + 1,
        error_updated_at: now_millis(),
        failure_count: state.failure_count + 1,
        failure_reason: Some(error),
        fetch_status: FetchStatus::Idle,
        status: QueryStatus::Error,
        ..state.clone()
      },
    },
    Action::Invalidate => QueryState {
      is_invalidated: true,
      ..state.clone()
    },
    Action::SetState { state } => state,
  }
}

pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Everything a [`QueryBehavior`] needs to build a fetch function.
pub struct FetchContext<T> {
  pub context: QueryFunctionContext,
  pub fetch_more: Option<FetchMore>,
  /// The data cached when the fetch started.
  pub data: Option<Arc<T>>,
  pub query_fn: Option<QueryFn<T>>,
}

/// A pluggable fetch strategy. The returned function is re-invoked on every
/// retry attempt.
pub trait QueryBehavior<T>: Send + Sync {
  fn on_fetch(&self, context: FetchContext<T>) -> FetchFn<T>;
}

/// The link from a query back to one of its observers.
pub(crate) trait QueryObserverLink<T>: Send + Sync {
  fn on_query_update(&self, action: ActionKind);
  fn is_enabled(&self) -> bool;
  fn is_result_stale(&self) -> bool;
  fn should_fetch_on_window_focus(&self) -> bool;
  fn should_fetch_on_reconnect(&self) -> bool;
  fn refetch_in_background(&self);
  fn query_options(&self) -> QueryOptions<T>;
}

/// A query with its data type erased, as stored by the [`QueryCache`].
pub trait CachedQuery: Send + Sync + 'static {
  fn query_key(&self) -> &QueryKey;
  fn query_hash(&self) -> &str;
  fn status(&self) -> QueryStatus;
  fn fetch_status(&self) -> FetchStatus;
  fn data_updated_at(&self) -> u64;
  fn has_data(&self) -> bool;
  fn is_invalidated(&self) -> bool;
  /// Some observer is enabled.
  fn is_active(&self) -> bool;
  /// Has observers, none of them enabled.
  fn is_disabled(&self) -> bool;
  fn is_stale(&self) -> bool;
  fn is_stale_by_time(&self, stale_time: Duration) -> bool;
  fn observer_count(&self) -> usize;
  fn invalidate(&self);
  fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()>;
  /// Fetches with the current options. Resolves at once when the fetch is
  /// paused.
  fn refetch(&self, options: FetchOptions) -> BoxFuture<'static, Result<(), QueryError>>;
  fn reset(&self);
  fn on_focus(&self);
  fn on_online(&self);
  fn destroy(&self);
  fn data_type_name(&self) -> &'static str;
  #[doc(hidden)]
  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn CachedQuery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("query_hash", &self.query_hash())
      .field("status", &self.status())
      .field("fetch_status", &self.fetch_status())
      .finish_non_exhaustive()
  }
}

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

struct InFlight<T> {
  id: u64,
  retryer: Retryer<Arc<T>>,
  promise: QueryFuture<T>,
  signal_consumed: Arc<AtomicBool>,
}

struct ObserverEntry<T> {
  id: u64,
  link: Weak<dyn QueryObserverLink<T>>,
}

struct QueryInner<T> {
  options: QueryOptions<T>,
  state: QueryState<T>,
  initial_state: QueryState<T>,
  revert_state: Option<QueryState<T>>,
  observers: Vec<ObserverEntry<T>>,
  in_flight: Option<InFlight<T>>,
  is_fetching_optimistic: bool,
}

/// One cache entry.
///
/// Holds the state for a key, runs at most one fetch at a time and tells its
/// observers and the owning cache about every transition.
pub struct Query<T: QueryData> {
  me: Weak<Query<T>>,
  query_key: QueryKey,
  query_hash: String,
  cache: Weak<QueryCache>,
  spawner: Arc<dyn TaskSpawner>,
  gc: Removable,
  inner: Mutex<QueryInner<T>>,
}

impl<T: QueryData> Query<T> {
  pub(crate) fn new(
    cache: Weak<QueryCache>,
    spawner: Arc<dyn TaskSpawner>,
    options: QueryOptions<T>,
    state: Option<QueryState<T>>,
  ) -> Arc<Self> {
    let initial_state = state.unwrap_or_else(|| default_state(&options));
    let cache_time = options.config.cache_time;
    let query = Arc::new_cyclic(|me| Query {
      me: me.clone(),
      query_key: options.query_key.clone(),
      query_hash: options.query_hash(),
      cache,
      spawner: spawner.clone(),
      gc: Removable::new(spawner),
      inner: Mutex::new(QueryInner {
        options,
        state: initial_state.clone(),
        initial_state,
        revert_state: None,
        observers: Vec::new(),
        in_flight: None,
        is_fetching_optimistic: false,
      }),
    });
    query.gc.update_cache_time(cache_time);
    query.schedule_gc();
    query
  }

  pub fn query_key(&self) -> &QueryKey {
    &self.query_key
  }

  pub fn query_hash(&self) -> &str {
    &self.query_hash
  }

  pub fn state(&self) -> QueryState<T> {
    self.inner.lock().state.clone()
  }

  pub fn data(&self) -> Option<Arc<T>> {
    self.inner.lock().state.data.clone()
  }

  pub fn options(&self) -> QueryOptions<T> {
    self.inner.lock().options.clone()
  }

  /// Replaces the options. The cache time only ever grows.
  pub fn set_options(&self, options: QueryOptions<T>) {
    let cache_time = options.config.cache_time;
    self.inner.lock().options = options;
    self.gc.update_cache_time(cache_time);
  }

  /// The effective garbage-collection delay.
  pub fn cache_time(&self) -> Duration {
    self.gc.cache_time()
  }

  /// Writes data as if it had been fetched.
  pub fn set_data(&self, data: T, options: SetDataOptions) -> Arc<T> {
    let data = {
      let inner = self.inner.lock();
      replace_data(inner.state.data.as_ref(), Arc::new(data), inner.options.config.shares_structure())
    };
    self.dispatch(Action::Success {
      data: data.clone(),
      updated_at: options.updated_at,
      manual: options.manual,
    });
    data
  }

  /// Replaces the whole state. A fetch status is only kept while a fetch is
  /// actually running.
  pub fn set_state(&self, mut state: QueryState<T>) {
    if self.inner.lock().in_flight.is_none() {
      state.fetch_status = FetchStatus::Idle;
    }
    self.dispatch(Action::SetState { state });
  }

  pub fn invalidate(&self) {
    if !self.inner.lock().state.is_invalidated {
      self.dispatch(Action::Invalidate);
    }
  }

  /// Cancels the running fetch. The returned future resolves once it settled.
  pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
    let retryer = self.inner.lock().in_flight.as_ref().map(|f| f.retryer.clone());
    match retryer {
      Some(retryer) => {
        let promise = retryer.promise();
        tracing::debug!(query_hash = %self.query_hash, revert = options.revert, silent = options.silent, "cancelling fetch");
        retryer.cancel(options);
        if options.silent {
          self.idle_after_silent_cancel();
        }
        async move {
          let _ = promise.await;
        }
        .boxed()
      }
      None => future::ready(()).boxed(),
    }
  }

  // A silent cancel settles without a dispatch. Unless another fetch took
  // over, nothing is fetching any more.
  fn idle_after_silent_cancel(&self) {
    let state = {
      let inner = self.inner.lock();
      if inner.in_flight.is_some() || inner.state.fetch_status == FetchStatus::Idle {
        return;
      }
      inner.state.clone()
    };
    self.dispatch(Action::SetState {
      state: QueryState {
        fetch_status: FetchStatus::Idle,
        fetch_meta: None,
        ..state
      },
    });
  }

  /// Stops timers and the running fetch.
  pub fn destroy(&self) {
    self.gc.clear_gc_timeout();
    // The cancel settles synchronously, the returned future is not needed.
    let _ = self.cancel(CancelOptions::silent());
  }

  /// Back to the state the entry was created with.
  pub fn reset(&self) {
    self.destroy();
    let initial = self.inner.lock().initial_state.clone();
    self.set_state(initial);
  }

  pub fn is_active(&self) -> bool {
    self.live_observers().iter().any(|observer| observer.is_enabled())
  }

  pub fn is_disabled(&self) -> bool {
    self.observer_count() > 0 && !self.is_active()
  }

  pub fn is_stale(&self) -> bool {
    {
      let inner = self.inner.lock();
      if inner.state.is_invalidated || inner.state.data_updated_at == 0 {
        return true;
      }
    }
    self.live_observers().iter().any(|observer| observer.is_result_stale())
  }

  pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
    let inner = self.inner.lock();
    inner.state.is_invalidated
      || inner.state.data_updated_at == 0
      || time_until_stale(inner.state.data_updated_at, stale_time).is_zero()
  }

  pub fn observer_count(&self) -> usize {
    self.inner.lock().observers.len()
  }

  pub fn is_fetching(&self) -> bool {
    self.inner.lock().state.fetch_status != FetchStatus::Idle
  }

  pub(crate) fn set_fetching_optimistic(&self, value: bool) {
    self.inner.lock().is_fetching_optimistic = value;
  }

  pub(crate) fn add_observer(&self, id: u64, link: Weak<dyn QueryObserverLink<T>>) {
    let added = {
      let mut inner = self.inner.lock();
      if inner.observers.iter().any(|entry| entry.id == id) {
        false
      } else {
        inner.observers.push(ObserverEntry { id, link });
        true
      }
    };
    if added {
      self.gc.clear_gc_timeout();
      self.notify_cache(QueryCacheEvent::ObserverAdded);
    }
  }

  pub(crate) fn remove_observer(&self, id: u64) {
    let (removed, now_empty, in_flight) = {
      let mut inner = self.inner.lock();
      let before = inner.observers.len();
      inner.observers.retain(|entry| entry.id != id);
      let in_flight = inner
        .in_flight
        .as_ref()
        .map(|f| (f.retryer.clone(), f.signal_consumed.load(Ordering::SeqCst)));
      (inner.observers.len() != before, inner.observers.is_empty(), in_flight)
    };
    if !removed {
      return;
    }

    if now_empty {
      if let Some((retryer, signal_consumed)) = in_flight {
        if signal_consumed {
          retryer.cancel(CancelOptions::revert());
        } else {
          retryer.cancel_retry();
        }
      }
      self.schedule_gc();
    }
    self.notify_cache(QueryCacheEvent::ObserverRemoved);
  }

  pub(crate) fn on_focus(&self) {
    let observer = self
      .live_observers()
      .into_iter()
      .find(|observer| observer.should_fetch_on_window_focus());
    if let Some(observer) = observer {
      observer.refetch_in_background();
    }
    self.continue_paused();
  }

  pub(crate) fn on_online(&self) {
    let observer = self
      .live_observers()
      .into_iter()
      .find(|observer| observer.should_fetch_on_reconnect());
    if let Some(observer) = observer {
      observer.refetch_in_background();
    }
    self.continue_paused();
  }

  fn continue_paused(&self) {
    let retryer = self.inner.lock().in_flight.as_ref().map(|f| f.retryer.clone());
    if let Some(retryer) = retryer {
      retryer.continue_execution();
    }
  }

  /// Starts a fetch, or joins the one already running.
  pub fn fetch(&self, options: Option<QueryOptions<T>>, fetch_options: FetchOptions) -> QueryFuture<T> {
    let running = {
      let inner = self.inner.lock();
      inner
        .in_flight
        .as_ref()
        .map(|f| (f.retryer.clone(), f.promise.clone(), inner.state.data_updated_at > 0))
    };
    if let Some((retryer, promise, has_data)) = running {
      if has_data && fetch_options.cancel_refetch {
        retryer.cancel(CancelOptions::silent());
      } else {
        retryer.continue_retry();
        return promise;
      }
    }

    if let Some(options) = options {
      self.set_options(options);
    }

    let mut options = self.options();
    if options.query_fn.is_none() {
      let borrowed = self
        .live_observers()
        .iter()
        .map(|observer| observer.query_options())
        .find(|options| options.query_fn.is_some());
      if let Some(borrowed) = borrowed {
        self.set_options(borrowed.clone());
        options = borrowed;
      }
    }

    let signal = CancellationToken::new();
    let signal_consumed = Arc::new(AtomicBool::new(false));
    let context = QueryFunctionContext::new(
      self.query_key.clone(),
      options.config.meta.clone(),
      signal.clone(),
      signal_consumed.clone(),
    );
    let Some(run) = self.fetch_fn(&options, &fetch_options, context) else {
      tracing::warn!(query_hash = %self.query_hash, "fetch requested without a query function");
      self.idle_after_silent_cancel();
      return future::ready(Err(QueryError::MissingQueryFn(self.query_hash.clone())))
        .boxed()
        .shared();
    };

    let fetch_id = NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed);
    let network_mode = options.config.resolved_network_mode();
    let retryer = Retryer::new(self.retryer_config(run, signal, fetch_id, &options));

    let promise = {
      let mut inner = self.inner.lock();
      if let Some(existing) = &inner.in_flight {
        return existing.promise.clone();
      }
      let promise = self.stored_data_promise(retryer.promise());
      inner.revert_state = Some(inner.state.clone());
      inner.in_flight = Some(InFlight {
        id: fetch_id,
        retryer: retryer.clone(),
        promise: promise.clone(),
        signal_consumed,
      });
      promise
    };

    let fetch_meta = fetch_options.fetch_more.as_ref().map(|more| FetchMeta {
      direction: Some(more.direction),
    });
    let needs_dispatch = {
      let inner = self.inner.lock();
      inner.state.fetch_status == FetchStatus::Idle || inner.state.fetch_meta != fetch_meta
    };
    if needs_dispatch {
      self.dispatch(Action::Fetch {
        meta: fetch_meta,
        can_fetch: can_fetch(network_mode),
      });
    }

    tracing::debug!(query_hash = %self.query_hash, "fetch started");
    let driver = promise.clone();
    self.spawner.spawn(Box::pin(async move {
      let _ = driver.await;
    }));
    promise
  }

  // Resolves to the reference the cache kept, which structural sharing may
  // have swapped for the previous, equal one.
  fn stored_data_promise(&self, promise: QueryFuture<T>) -> QueryFuture<T> {
    let me = self.me.clone();
    promise
      .map(move |outcome| {
        outcome.map(|data| match me.upgrade().and_then(|query| query.data()) {
          Some(stored) if *stored == *data => stored,
          _ => data,
        })
      })
      .boxed()
      .shared()
  }

  fn fetch_fn(
    &self,
    options: &QueryOptions<T>,
    fetch_options: &FetchOptions,
    context: QueryFunctionContext,
  ) -> Option<RunFn<Arc<T>>> {
    if let Some(behavior) = &options.behavior {
      let fetch = behavior.on_fetch(FetchContext {
        context,
        fetch_more: fetch_options.fetch_more.clone(),
        data: self.data(),
        query_fn: options.query_fn.clone(),
      });
      return Some(Arc::new(move || fetch().map(|result| result.map(Arc::new)).boxed()));
    }
    let query_fn = options.query_fn.clone()?;
    Some(Arc::new(move || {
      query_fn(context.clone())
        .map(|result| result.map(Arc::new))
        .boxed()
    }))
  }

  fn retryer_config(
    &self,
    run: RunFn<Arc<T>>,
    signal: CancellationToken,
    fetch_id: u64,
    options: &QueryOptions<T>,
  ) -> RetryerConfig<Arc<T>> {
    let mut config = RetryerConfig::new(run);
    config.abort = Some(Arc::new(signal));
    config.retry = options.config.retry_or(Retry::Count(3));
    config.retry_delay = options.config.resolved_retry_delay();
    config.network_mode = options.config.resolved_network_mode();

    let me = self.me.clone();
    config.on_fail = Some(Box::new(move |failure_count, error| {
      if let Some(query) = me.upgrade() {
        query.dispatch(Action::Failed {
          failure_count,
          error: error.clone(),
        });
      }
    }));
    let me = self.me.clone();
    config.on_pause = Some(Box::new(move || {
      if let Some(query) = me.upgrade() {
        query.dispatch(Action::Pause);
      }
    }));
    let me = self.me.clone();
    config.on_continue = Some(Box::new(move || {
      if let Some(query) = me.upgrade() {
        query.dispatch(Action::Continue);
      }
    }));
    let me = self.me.clone();
    config.on_success = Some(Box::new(move |data: &Arc<T>| {
      if let Some(query) = me.upgrade() {
        query.on_fetch_success(fetch_id, data.clone());
      }
    }));
    let me = self.me.clone();
    config.on_error = Some(Box::new(move |error: &QueryError| {
      if let Some(query) = me.upgrade() {
        query.on_fetch_error(fetch_id, error.clone());
      }
    }));
    config
  }

  fn on_fetch_success(&self, fetch_id: u64, data: Arc<T>) {
    let data = {
      let inner = self.inner.lock();
      replace_data(inner.state.data.as_ref(), data, inner.options.config.shares_structure())
    };
    self.dispatch_settled(
      fetch_id,
      Action::Success {
        data,
        updated_at: None,
        manual: false,
      },
    );
    if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
      cache.on_query_success(me);
    }
    self.finish_fetch();
  }

  fn on_fetch_error(&self, fetch_id: u64, error: QueryError) {
    let cancelled = error.as_cancelled().copied();
    if cancelled.is_some_and(|c| c.silent) {
      let mut inner = self.inner.lock();
      if inner.in_flight.as_ref().is_some_and(|f| f.id == fetch_id) {
        inner.in_flight = None;
      }
    } else {
      self.dispatch_settled(fetch_id, Action::Error { error: error.clone() });
    }

    if cancelled.is_none() {
      tracing::debug!(query_hash = %self.query_hash, error = %error, "fetch failed");
      if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
        cache.on_query_error(&error, me);
      }
    }
    self.finish_fetch();
  }

  fn finish_fetch(&self) {
    let optimistic = std::mem::replace(&mut self.inner.lock().is_fetching_optimistic, false);
    if !optimistic {
      self.schedule_gc();
    }
  }

  fn schedule_gc(&self) {
    let me = self.me.clone();
    self.gc.schedule_gc(move || {
      if let Some(query) = me.upgrade() {
        query.optional_remove();
      }
    });
  }

  fn optional_remove(&self) {
    let (unobserved, idle) = {
      let inner = self.inner.lock();
      (
        inner.observers.is_empty(),
        inner.state.fetch_status == FetchStatus::Idle,
      )
    };
    if !unobserved {
      return;
    }
    if !idle {
      self.schedule_gc();
      return;
    }
    if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
      tracing::debug!(query_hash = %self.query_hash, "removing unused query");
      let me: Arc<dyn CachedQuery> = me;
      cache.remove(&me);
    }
  }

  fn live_observers(&self) -> Vec<Arc<dyn QueryObserverLink<T>>> {
    self
      .inner
      .lock()
      .observers
      .iter()
      .filter_map(|entry| entry.link.upgrade())
      .collect()
  }

  pub(crate) fn dispatch(&self, action: Action<T>) {
    self.apply(None, action);
  }

  fn dispatch_settled(&self, fetch_id: u64, action: Action<T>) {
    self.apply(Some(fetch_id), action);
  }

  fn apply(&self, settled: Option<u64>, action: Action<T>) {
    let kind = action.kind();
    {
      let mut inner = self.inner.lock();
      let next = reduce(&inner.state, action, inner.revert_state.as_ref());
      inner.state = next;
      if let Some(fetch_id) = settled {
        if inner.in_flight.as_ref().is_some_and(|f| f.id == fetch_id) {
          inner.in_flight = None;
        }
      }
    }

    let observers = self.live_observers();
    notify_manager().batch(|| {
      for observer in &observers {
        observer.on_query_update(kind);
      }
      if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
        cache.notify(QueryCacheEvent::Updated {
          query: me,
          action: kind,
        });
      }
    });
  }

  fn notify_cache(&self, event: fn(Arc<dyn CachedQuery>) -> QueryCacheEvent) {
    if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
      cache.notify(event(me));
    }
  }
}

impl<T: QueryData> CachedQuery for Query<T> {
  fn query_key(&self) -> &QueryKey {
    &self.query_key
  }

  fn query_hash(&self) -> &str {
    &self.query_hash
  }

  fn status(&self) -> QueryStatus {
    self.inner.lock().state.status
  }

  fn fetch_status(&self) -> FetchStatus {
    self.inner.lock().state.fetch_status
  }

  fn data_updated_at(&self) -> u64 {
    self.inner.lock().state.data_updated_at
  }

  fn has_data(&self) -> bool {
    self.inner.lock().state.data.is_some()
  }

  fn is_invalidated(&self) -> bool {
    self.inner.lock().state.is_invalidated
  }

  fn is_active(&self) -> bool {
    Query::is_active(self)
  }

  fn is_disabled(&self) -> bool {
    Query::is_disabled(self)
  }

  fn is_stale(&self) -> bool {
    Query::is_stale(self)
  }

  fn is_stale_by_time(&self, stale_time: Duration) -> bool {
    Query::is_stale_by_time(self, stale_time)
  }

  fn observer_count(&self) -> usize {
    Query::observer_count(self)
  }

  fn invalidate(&self) {
    Query::invalidate(self)
  }

  fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
    Query::cancel(self, options)
  }

  fn refetch(&self, options: FetchOptions) -> BoxFuture<'static, Result<(), QueryError>> {
    let promise = self.fetch(None, options);
    if CachedQuery::fetch_status(self) == FetchStatus::Paused {
      return future::ready(Ok(())).boxed();
    }
    promise.map(|result| result.map(|_| ())).boxed()
  }

  fn reset(&self) {
    Query::reset(self)
  }

  fn on_focus(&self) {
    Query::on_focus(self)
  }

  fn on_online(&self) {
    Query::on_online(self)
  }

  fn destroy(&self) {
    Query::destroy(self)
  }

  fn data_type_name(&self) -> &'static str {
    std::any::type_name::<T>()
  }

  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

impl<T: QueryData> fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Query")
      .field("query_hash", &self.query_hash)
      .field("status", &inner.state.status)
      .field("fetch_status", &inner.state.fetch_status)
      .field("observers", &inner.observers.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CancelledError;

  fn success(value: i32) -> Action<i32> {
    Action::Success {
      data: Arc::new(value),
      updated_at: Some(10),
      manual: false,
    }
  }

  #[test]
  fn fetch_keeps_success_status_once_data_exists() {
    let state = reduce(&QueryState::pending(), success(1), None);
    let fetching = reduce(
      &state,
      Action::Fetch {
        meta: None,
        can_fetch: true,
      },
      None,
    );
    assert_eq!(fetching.status, QueryStatus::Success);
    assert_eq!(fetching.fetch_status, FetchStatus::Fetching);

    let fresh = reduce(
      &QueryState::<i32>::pending(),
      Action::Fetch {
        meta: None,
        can_fetch: false,
      },
      None,
    );
    assert_eq!(fresh.status, QueryStatus::Pending);
    assert_eq!(fresh.fetch_status, FetchStatus::Paused);
  }

  #[test]
  fn errors_count_failures_and_keep_data() {
    let state = reduce(&QueryState::pending(), success(1), None);
    let failed = reduce(
      &state,
      Action::Failed {
        failure_count: 3,
        error: QueryError::fetch("x"),
      },
      None,
    );
    let errored = reduce(&failed, Action::Error { error: QueryError::fetch("x") }, None);
    assert_eq!(errored.status, QueryStatus::Error);
    assert_eq!(errored.failure_count, 4);
    assert_eq!(errored.error_update_count, 1);
    assert_eq!(errored.data.as_deref(), Some(&1));
    assert_eq!(errored.fetch_status, FetchStatus::Idle);
  }

  #[test]
  fn cancellation_reverts_or_only_goes_idle() {
    let before = QueryState::<i32>::pending();
    let fetching = reduce(
      &before,
      Action::Fetch {
        meta: None,
        can_fetch: true,
      },
      None,
    );
    let failed = reduce(
      &fetching,
      Action::Failed {
        failure_count: 1,
        error: QueryError::fetch("x"),
      },
      None,
    );

    let reverted = reduce(
      &failed,
      Action::Error {
        error: CancelledError { revert: true, silent: false }.into(),
      },
      Some(&before),
    );
    assert_eq!(reverted.failure_count, 0);
    assert_eq!(reverted.fetch_status, FetchStatus::Idle);
    assert!(reverted.error.is_none());

    let idle = reduce(
      &failed,
      Action::Error {
        error: CancelledError { revert: false, silent: false }.into(),
      },
      Some(&before),
    );
    assert_eq!(idle.failure_count, 1);
    assert_eq!(idle.fetch_status, FetchStatus::Idle);
    assert_eq!(idle.status, QueryStatus::Pending);
  }

  #[test]
  fn manual_success_leaves_fetch_state_alone() {
    let fetching = reduce(
      &QueryState::<i32>::pending(),
      Action::Fetch {
        meta: None,
        can_fetch: true,
      },
      None,
    );
    let manual = reduce(
      &fetching,
      Action::Success {
        data: Arc::new(5),
        updated_at: None,
        manual: true,
      },
      None,
    );
    assert_eq!(manual.status, QueryStatus::Success);
    assert_eq!(manual.fetch_status, FetchStatus::Fetching);
    assert!(manual.data_updated_at > 0);
  }

  #[test]
  fn equal_data_keeps_its_identity() {
    let prev = Arc::new(vec![1, 2, 3]);
    let kept = replace_data(Some(&prev), Arc::new(vec![1, 2, 3]), true);
    assert!(Arc::ptr_eq(&prev, &kept));
    let replaced = replace_data(Some(&prev), Arc::new(vec![1, 2, 3]), false);
    assert!(!Arc::ptr_eq(&prev, &replaced));
  }
}
