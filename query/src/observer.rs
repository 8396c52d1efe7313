//! Per-subscriber views of a query.
//!
//! A [`QueryObserver`] resolves its options against the client defaults,
//! attaches itself to the matching [`Query`], decides when that query should
//! fetch, and derives a [`QueryObserverResult`] from the query state. Listeners
//! are only woken when a field they care about changed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::HashSet;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::{same_error, QueryError};
use crate::focus_manager::focus_manager;
use crate::notify::notify_manager;
use crate::options::{
  FetchOptions, NotifyOnChangeProps, PlaceholderData, QueryConfig, QueryData, QueryObserverOptions, QueryOptions,
  RefetchOn, RefetchOptions,
};
use crate::query::{ActionKind, CachedQuery, FetchStatus, Query, QueryFuture, QueryObserverLink, QueryState, QueryStatus};
use crate::query_cache::QueryCacheEvent;
use crate::retryer::can_fetch;
use crate::subscribable::{ListenerId, Subscribable};
use crate::task::timer::{Interval, Timeout};
use crate::time::{is_finite, time_until_stale};

/// A field of [`QueryObserverResult`], used to decide which changes notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
  Data,
  DataUpdatedAt,
  Error,
  ErrorUpdatedAt,
  ErrorUpdateCount,
  FailureCount,
  FailureReason,
  /// Also covers the derived `is_pending`/`is_success`/`is_error` predicates.
  Status,
  /// Also covers `is_fetching`/`is_paused`.
  FetchStatus,
  IsFetched,
  IsFetchedAfterMount,
  IsPlaceholderData,
  IsPreviousData,
  IsStale,
}

/// What an observer exposes to its listeners.
pub struct QueryObserverResult<S> {
  pub data: Option<Arc<S>>,
  pub data_updated_at: u64,
  pub error: Option<QueryError>,
  pub error_updated_at: u64,
  pub error_update_count: u32,
  pub failure_count: u32,
  pub failure_reason: Option<QueryError>,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  pub is_fetched: bool,
  pub is_fetched_after_mount: bool,
  pub is_placeholder_data: bool,
  pub is_previous_data: bool,
  pub is_stale: bool,
}

impl<S> Clone for QueryObserverResult<S> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      data_updated_at: self.data_updated_at,
      error: self.error.clone(),
      error_updated_at: self.error_updated_at,
      error_update_count: self.error_update_count,
      failure_count: self.failure_count,
      failure_reason: self.failure_reason.clone(),
      status: self.status,
      fetch_status: self.fetch_status,
      is_fetched: self.is_fetched,
      is_fetched_after_mount: self.is_fetched_after_mount,
      is_placeholder_data: self.is_placeholder_data,
      is_previous_data: self.is_previous_data,
      is_stale: self.is_stale,
    }
  }
}

impl<S: fmt::Debug> fmt::Debug for QueryObserverResult<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryObserverResult")
      .field("status", &self.status)
      .field("fetch_status", &self.fetch_status)
      .field("data", &self.data)
      .field("error", &self.error)
      .field("is_stale", &self.is_stale)
      .finish_non_exhaustive()
  }
}

impl<S> QueryObserverResult<S> {
  pub fn is_pending(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }

  pub fn is_paused(&self) -> bool {
    self.fetch_status == FetchStatus::Paused
  }

  /// Pending and fetching: the first load is in progress.
  pub fn is_loading(&self) -> bool {
    self.is_pending() && self.is_fetching()
  }

  pub fn is_initial_loading(&self) -> bool {
    self.is_loading()
  }

  /// Fetching while data (or an error) is already shown.
  pub fn is_refetching(&self) -> bool {
    self.is_fetching() && !self.is_pending()
  }

  pub fn is_loading_error(&self) -> bool {
    self.is_error() && self.data_updated_at == 0
  }

  pub fn is_refetch_error(&self) -> bool {
    self.is_error() && self.data_updated_at != 0
  }

  pub(crate) fn changed_fields(&self, other: &QueryObserverResult<S>) -> Vec<ResultField> {
    let mut changed = Vec::new();
    let same_data = match (&self.data, &other.data) {
      (Some(a), Some(b)) => Arc::ptr_eq(a, b),
      (None, None) => true,
      _ => false,
    };
    if !same_data {
      changed.push(ResultField::Data);
    }
    if self.data_updated_at != other.data_updated_at {
      changed.push(ResultField::DataUpdatedAt);
    }
    if !same_error(self.error.as_ref(), other.error.as_ref()) {
      changed.push(ResultField::Error);
    }
    if self.error_updated_at != other.error_updated_at {
      changed.push(ResultField::ErrorUpdatedAt);
    }
    if self.error_update_count != other.error_update_count {
      changed.push(ResultField::ErrorUpdateCount);
    }
    if self.failure_count != other.failure_count {
      changed.push(ResultField::FailureCount);
    }
    if !same_error(self.failure_reason.as_ref(), other.failure_reason.as_ref()) {
      changed.push(ResultField::FailureReason);
    }
    if self.status != other.status {
      changed.push(ResultField::Status);
    }
    if self.fetch_status != other.fetch_status {
      changed.push(ResultField::FetchStatus);
    }
    if self.is_fetched != other.is_fetched {
      changed.push(ResultField::IsFetched);
    }
    if self.is_fetched_after_mount != other.is_fetched_after_mount {
      changed.push(ResultField::IsFetchedAfterMount);
    }
    if self.is_placeholder_data != other.is_placeholder_data {
      changed.push(ResultField::IsPlaceholderData);
    }
    if self.is_previous_data != other.is_previous_data {
      changed.push(ResultField::IsPreviousData);
    }
    if self.is_stale != other.is_stale {
      changed.push(ResultField::IsStale);
    }
    changed
  }
}

/// A result whose field reads are recorded, so the observer only notifies
/// about changes to fields that were actually read.
pub struct TrackedResult<S> {
  result: QueryObserverResult<S>,
  tracked: Arc<Mutex<HashSet<ResultField>>>,
}

impl<S> TrackedResult<S> {
  fn track(&self, field: ResultField) {
    self.tracked.lock().insert(field);
  }

  pub fn data(&self) -> Option<&Arc<S>> {
    self.track(ResultField::Data);
    self.result.data.as_ref()
  }

  pub fn data_updated_at(&self) -> u64 {
    self.track(ResultField::DataUpdatedAt);
    self.result.data_updated_at
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.track(ResultField::Error);
    self.result.error.as_ref()
  }

  pub fn error_updated_at(&self) -> u64 {
    self.track(ResultField::ErrorUpdatedAt);
    self.result.error_updated_at
  }

  pub fn failure_count(&self) -> u32 {
    self.track(ResultField::FailureCount);
    self.result.failure_count
  }

  pub fn failure_reason(&self) -> Option<&QueryError> {
    self.track(ResultField::FailureReason);
    self.result.failure_reason.as_ref()
  }

  pub fn status(&self) -> QueryStatus {
    self.track(ResultField::Status);
    self.result.status
  }

  pub fn fetch_status(&self) -> FetchStatus {
    self.track(ResultField::FetchStatus);
    self.result.fetch_status
  }

  pub fn is_pending(&self) -> bool {
    self.status() == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status() == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status() == QueryStatus::Error
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status() == FetchStatus::Fetching
  }

  pub fn is_loading(&self) -> bool {
    self.is_pending() && self.is_fetching()
  }

  pub fn is_stale(&self) -> bool {
    self.track(ResultField::IsStale);
    self.result.is_stale
  }

  pub fn is_placeholder_data(&self) -> bool {
    self.track(ResultField::IsPlaceholderData);
    self.result.is_placeholder_data
  }

  pub fn is_previous_data(&self) -> bool {
    self.track(ResultField::IsPreviousData);
    self.result.is_previous_data
  }

  pub fn is_fetched(&self) -> bool {
    self.track(ResultField::IsFetched);
    self.result.is_fetched
  }

  pub fn is_fetched_after_mount(&self) -> bool {
    self.track(ResultField::IsFetchedAfterMount);
    self.result.is_fetched_after_mount
  }

  /// The wrapped result, without tracking anything.
  pub fn into_inner(self) -> QueryObserverResult<S> {
    self.result
  }
}

fn is_stale<T: QueryData>(query: &Query<T>, config: &QueryConfig) -> bool {
  config.is_enabled() && query.is_stale_by_time(config.resolved_stale_time())
}

fn should_load_on_mount<T: QueryData>(query: &Query<T>, config: &QueryConfig) -> bool {
  let state = query.state();
  config.is_enabled()
    && state.data_updated_at == 0
    && !(state.status == QueryStatus::Error && !config.retries_on_mount())
}

pub(crate) fn should_fetch_on<T: QueryData>(query: &Query<T>, config: &QueryConfig, refetch: RefetchOn) -> bool {
  if !config.is_enabled() {
    return false;
  }
  match refetch {
    RefetchOn::Always => true,
    RefetchOn::Never => false,
    RefetchOn::IfStale => is_stale(query, config),
  }
}

pub(crate) fn should_fetch_on_mount<T: QueryData>(query: &Query<T>, config: &QueryConfig) -> bool {
  should_load_on_mount(query, config)
    || (query.state().data_updated_at > 0 && should_fetch_on(query, config, config.resolved_refetch_on_mount()))
}

fn should_fetch_optionally<T: QueryData>(
  query: &Arc<Query<T>>,
  prev_query: &Arc<Query<T>>,
  config: &QueryConfig,
  prev_config: &QueryConfig,
) -> bool {
  config.is_enabled()
    && (!Arc::ptr_eq(query, prev_query) || !prev_config.is_enabled())
    && (!config.is_suspense() || query.state().status != QueryStatus::Error)
    && is_stale(query, config)
}

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type ResultListener<S> = dyn Fn(&QueryObserverResult<S>) + Send + Sync;

struct SelectMemo<T, S> {
  source: Arc<T>,
  select: crate::options::Selector<T, S>,
  result: Arc<S>,
}

struct ObserverInner<T: QueryData, S> {
  options: QueryObserverOptions<T, S>,
  query: Arc<Query<T>>,
  initial_data_update_count: u32,
  initial_error_update_count: u32,
  result: QueryObserverResult<S>,
  result_placeholder: Option<PlaceholderData<T>>,
  previous_query_result: Option<QueryObserverResult<S>>,
  select_memo: Option<SelectMemo<T, S>>,
  stale_timeout: Option<Timeout>,
  refetch_interval: Option<Interval>,
  current_refetch_interval: Option<Duration>,
}

pub(crate) struct ObserverShared<T: QueryData, S: QueryData> {
  id: u64,
  me: Weak<ObserverShared<T, S>>,
  client: QueryClient,
  listeners: Subscribable<ResultListener<S>>,
  tracked: Arc<Mutex<HashSet<ResultField>>>,
  inner: Mutex<ObserverInner<T, S>>,
}

/// Observes one query. Dropping the observer detaches it.
pub struct QueryObserver<T: QueryData, S: QueryData = T> {
  shared: Arc<ObserverShared<T, S>>,
}

impl<T: QueryData, S: QueryData> QueryObserver<T, S> {
  pub fn new(client: &QueryClient, options: impl Into<QueryObserverOptions<T, S>>) -> Result<Self, QueryError> {
    let options = client.default_observer_options(options.into());
    let query = client.query_cache().build(&options.query, None)?;
    let state = query.state();

    let shared = Arc::new_cyclic(|me| ObserverShared {
      id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
      me: me.clone(),
      client: client.clone(),
      listeners: Subscribable::new(),
      tracked: Arc::new(Mutex::new(HashSet::default())),
      inner: Mutex::new(ObserverInner {
        options: options.clone(),
        query: query.clone(),
        initial_data_update_count: state.data_update_count,
        initial_error_update_count: state.error_update_count,
        result: bare_result(&state),
        result_placeholder: None,
        previous_query_result: None,
        select_memo: None,
        stale_timeout: None,
        refetch_interval: None,
        current_refetch_interval: None,
      }),
    });

    {
      let mut inner = shared.inner.lock();
      let result = create_result(&mut inner, &query, &options, false, false);
      inner.result = result;
      inner.result_placeholder = options.placeholder_data.clone();
    }

    Ok(Self { shared })
  }

  /// Registers a listener. The first listener attaches the observer to its
  /// query and may trigger a fetch.
  pub fn subscribe(&self, listener: impl Fn(&QueryObserverResult<S>) + Send + Sync + 'static) -> ListenerId {
    let id = self.shared.listeners.subscribe(Arc::new(listener));
    if self.shared.listeners.listener_count() == 1 {
      self.shared.on_subscribe();
    }
    id
  }

  /// Removes a listener. Removing the last one detaches the observer.
  pub fn unsubscribe(&self, id: ListenerId) {
    self.shared.listeners.unsubscribe(id);
    if !self.shared.listeners.has_listeners() {
      self.shared.destroy();
    }
  }

  pub fn has_listeners(&self) -> bool {
    self.shared.listeners.has_listeners()
  }

  pub fn listener_count(&self) -> usize {
    self.shared.listeners.listener_count()
  }

  pub fn destroy(&self) {
    self.shared.destroy();
  }

  pub fn set_options(&self, options: impl Into<QueryObserverOptions<T, S>>) -> Result<(), QueryError> {
    self.shared.set_options(options.into())
  }

  pub fn options(&self) -> QueryObserverOptions<T, S> {
    self.shared.inner.lock().options.clone()
  }

  pub fn current_result(&self) -> QueryObserverResult<S> {
    self.shared.inner.lock().result.clone()
  }

  pub fn current_query(&self) -> Arc<Query<T>> {
    self.shared.inner.lock().query.clone()
  }

  /// Looks up the query the observer is bound to at call time, without
  /// keeping the observer alive.
  pub(crate) fn query_resolver(&self) -> impl Fn() -> Option<Arc<Query<T>>> + Send + Sync + 'static {
    let shared = Arc::downgrade(&self.shared);
    move || shared.upgrade().map(|shared| shared.inner.lock().query.clone())
  }

  /// Wraps `result` so that reading a field subscribes the observer's
  /// listeners to changes of that field.
  pub fn track_result(&self, result: QueryObserverResult<S>) -> TrackedResult<S> {
    TrackedResult {
      result,
      tracked: self.shared.tracked.clone(),
    }
  }

  /// The result these options would produce right now, including a fetch
  /// that mounting would start.
  pub fn get_optimistic_result(
    &self,
    options: impl Into<QueryObserverOptions<T, S>>,
  ) -> Result<QueryObserverResult<S>, QueryError> {
    let options = self.shared.client.default_observer_options(options.into());
    let query = self.shared.client.query_cache().build(&options.query, None)?;
    let mounted = self.shared.listeners.has_listeners();
    let mut inner = self.shared.inner.lock();
    Ok(create_result(&mut inner, &query, &options, mounted, true))
  }

  /// Fetches the query for `options` without attaching to it, resolving to
  /// the result it would produce.
  pub fn fetch_optimistic(
    &self,
    options: impl Into<QueryObserverOptions<T, S>>,
  ) -> BoxFuture<'static, Result<QueryObserverResult<S>, QueryError>> {
    let options = self.shared.client.default_observer_options(options.into());
    let query = match self.shared.client.query_cache().build(&options.query, None) {
      Ok(query) => query,
      Err(error) => return futures_util::future::ready(Err(error)).boxed(),
    };
    query.set_fetching_optimistic(true);
    let promise = query.fetch(Some(options.query.clone()), FetchOptions::default());
    let shared = self.shared.clone();
    async move {
      let _ = promise.await;
      let mounted = shared.listeners.has_listeners();
      let mut inner = shared.inner.lock();
      Ok(create_result(&mut inner, &query, &options, mounted, false))
    }
    .boxed()
  }

  /// Refetches the query and resolves to the updated result.
  pub fn refetch(&self, options: RefetchOptions) -> BoxFuture<'static, Result<QueryObserverResult<S>, QueryError>> {
    self.shared.fetch(options.into(), options.throw_on_error)
  }

  pub(crate) fn fetch(
    &self,
    fetch_options: FetchOptions,
    throw_on_error: bool,
  ) -> BoxFuture<'static, Result<QueryObserverResult<S>, QueryError>> {
    self.shared.fetch(fetch_options, throw_on_error)
  }

  /// Removes the observed query from the cache.
  pub fn remove(&self) {
    let query: Arc<dyn CachedQuery> = self.current_query();
    self.shared.client.query_cache().remove(&query);
  }

  /// Whether a suspense-style consumer should wait for the running fetch.
  pub fn should_suspend(&self, result: &QueryObserverResult<S>) -> bool {
    let suspense = self.shared.inner.lock().options.query.config.is_suspense();
    suspense && result.is_pending() && result.is_fetching()
  }

  pub(crate) fn id(&self) -> u64 {
    self.shared.id
  }
}

impl<T: QueryData, S: QueryData> Drop for QueryObserver<T, S> {
  fn drop(&mut self) {
    self.shared.destroy();
  }
}

impl<T: QueryData, S: QueryData> fmt::Debug for QueryObserver<T, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryObserver")
      .field("id", &self.shared.id)
      .field("listeners", &self.shared.listeners.listener_count())
      .finish_non_exhaustive()
  }
}

fn bare_result<T, S>(state: &QueryState<T>) -> QueryObserverResult<S> {
  QueryObserverResult {
    data: None,
    data_updated_at: state.data_updated_at,
    error: state.error.clone(),
    error_updated_at: state.error_updated_at,
    error_update_count: state.error_update_count,
    failure_count: state.failure_count,
    failure_reason: state.failure_reason.clone(),
    status: state.status,
    fetch_status: state.fetch_status,
    is_fetched: false,
    is_fetched_after_mount: false,
    is_placeholder_data: false,
    is_previous_data: false,
    is_stale: true,
  }
}

/// Derives the observer result for `query` under `options`.
///
/// `inner` still describes the previously derived result; only the select
/// memo is updated here.
fn create_result<T: QueryData, S: QueryData>(
  inner: &mut ObserverInner<T, S>,
  query: &Arc<Query<T>>,
  options: &QueryObserverOptions<T, S>,
  mounted: bool,
  optimistic: bool,
) -> QueryObserverResult<S> {
  let config = &options.query.config;
  let query_change = !Arc::ptr_eq(query, &inner.query);
  let state = query.state();
  let (initial_data_updates, initial_error_updates) = if query_change {
    (state.data_update_count, state.error_update_count)
  } else {
    (inner.initial_data_update_count, inner.initial_error_update_count)
  };
  let prev_query_result = if query_change {
    Some(inner.result.clone())
  } else {
    inner.previous_query_result.clone()
  };

  let mut data_updated_at = state.data_updated_at;
  let mut status = state.status;
  let mut fetch_status = state.fetch_status;
  let mut is_previous_data = false;
  let mut is_placeholder_data = false;

  if optimistic {
    let fetch_on_mount = !mounted && should_fetch_on_mount(query, config);
    let fetch_optionally = mounted && should_fetch_optionally(query, &inner.query, config, &inner.options.query.config);
    if fetch_on_mount || fetch_optionally {
      fetch_status = if can_fetch(config.resolved_network_mode()) {
        FetchStatus::Fetching
      } else {
        FetchStatus::Paused
      };
      if data_updated_at == 0 {
        status = QueryStatus::Pending;
      }
    }
  }

  let mut data: Option<Arc<S>> = None;
  let keep_previous = config.keeps_previous_data()
    && state.data_updated_at == 0
    && status != QueryStatus::Error
    && prev_query_result.as_ref().is_some_and(|prev| prev.is_success());

  if keep_previous {
    if let Some(prev) = &prev_query_result {
      data = prev.data.clone();
      data_updated_at = prev.data_updated_at;
      status = prev.status;
      is_previous_data = true;
    }
  } else if let Some(source) = &state.data {
    data = Some(select_data(inner, source, options));
  }

  if data.is_none() && status == QueryStatus::Pending {
    if let Some(placeholder) = &options.placeholder_data {
      let reuse = inner.result.is_placeholder_data
        && inner
          .result_placeholder
          .as_ref()
          .is_some_and(|previous| previous.same_source(placeholder));
      let placeholder_data = if reuse {
        inner.result.data.clone()
      } else {
        placeholder
          .resolve()
          .map(|value| share(inner.result.data.as_ref(), options.select.apply(value), config))
      };
      if let Some(placeholder_data) = placeholder_data {
        status = QueryStatus::Success;
        data = Some(placeholder_data);
        is_placeholder_data = true;
      }
    }
  }

  QueryObserverResult {
    data,
    data_updated_at,
    error: state.error.clone(),
    error_updated_at: state.error_updated_at,
    error_update_count: state.error_update_count,
    failure_count: state.failure_count,
    failure_reason: state.failure_reason.clone(),
    status,
    fetch_status,
    is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
    is_fetched_after_mount: state.data_update_count > initial_data_updates
      || state.error_update_count > initial_error_updates,
    is_placeholder_data,
    is_previous_data,
    is_stale: is_stale(query, config),
  }
}

fn share<S: QueryData>(prev: Option<&Arc<S>>, next: Arc<S>, config: &QueryConfig) -> Arc<S> {
  crate::query::replace_data(prev, next, config.shares_structure())
}

fn select_data<T: QueryData, S: QueryData>(
  inner: &mut ObserverInner<T, S>,
  source: &Arc<T>,
  options: &QueryObserverOptions<T, S>,
) -> Arc<S> {
  if options.select.is_identity() {
    return options.select.apply(source.clone());
  }
  if let Some(memo) = &inner.select_memo {
    if Arc::ptr_eq(&memo.source, source) && memo.select.same_as(&options.select) {
      return memo.result.clone();
    }
  }
  let selected = share(inner.result.data.as_ref(), options.select.apply(source.clone()), &options.query.config);
  inner.select_memo = Some(SelectMemo {
    source: source.clone(),
    select: options.select.clone(),
    result: selected.clone(),
  });
  selected
}

impl<T: QueryData, S: QueryData> ObserverShared<T, S> {
  fn link(&self) -> Weak<dyn QueryObserverLink<T>> {
    self.me.clone()
  }

  fn on_subscribe(&self) {
    let (query, config) = {
      let inner = self.inner.lock();
      (inner.query.clone(), inner.options.query.config.clone())
    };
    query.add_observer(self.id, self.link());
    if should_fetch_on_mount(&query, &config) {
      self.execute_fetch_detached(FetchOptions::default());
    }
    self.update_timers();
  }

  fn destroy(&self) {
    self.listeners.clear();
    let query = {
      let mut inner = self.inner.lock();
      inner.stale_timeout = None;
      inner.refetch_interval = None;
      inner.query.clone()
    };
    query.remove_observer(self.id);
  }

  fn set_options(&self, options: QueryObserverOptions<T, S>) -> Result<(), QueryError> {
    let options = self.client.default_observer_options(options);
    let (prev_options, prev_query) = {
      let mut inner = self.inner.lock();
      let prev_options = std::mem::replace(&mut inner.options, options.clone());
      (prev_options, inner.query.clone())
    };
    self
      .client
      .query_cache()
      .notify(QueryCacheEvent::ObserverOptionsUpdated(prev_query.clone()));

    let query = self.update_query()?;
    let mounted = self.listeners.has_listeners();
    let config = &options.query.config;
    let prev_config = &prev_options.query.config;

    if mounted && should_fetch_optionally(&query, &prev_query, config, prev_config) {
      self.execute_fetch_detached(FetchOptions::default());
    }

    self.update_result();

    if mounted {
      let query_changed = !Arc::ptr_eq(&query, &prev_query);
      let enabled_changed = config.is_enabled() != prev_config.is_enabled();
      if query_changed || enabled_changed || config.resolved_stale_time() != prev_config.resolved_stale_time() {
        self.update_stale_timeout();
      }
      let next_interval = config.resolved_refetch_interval();
      let current_interval = self.inner.lock().current_refetch_interval;
      if query_changed || enabled_changed || next_interval != current_interval {
        self.update_refetch_interval(next_interval);
      }
    }
    Ok(())
  }

  /// Points the observer at the query for its current options.
  fn update_query(&self) -> Result<Arc<Query<T>>, QueryError> {
    let options = self.inner.lock().options.clone();
    let query = self.client.query_cache().build(&options.query, None)?;

    let prev_query = {
      let mut inner = self.inner.lock();
      if Arc::ptr_eq(&inner.query, &query) {
        return Ok(query);
      }
      let state = query.state();
      inner.initial_data_update_count = state.data_update_count;
      inner.initial_error_update_count = state.error_update_count;
      inner.previous_query_result = Some(inner.result.clone());
      std::mem::replace(&mut inner.query, query.clone())
    };

    if self.listeners.has_listeners() {
      prev_query.remove_observer(self.id);
      query.add_observer(self.id, self.link());
    }
    Ok(query)
  }

  fn update_result(&self) {
    let mounted = self.listeners.has_listeners();
    let (result, query, notify_listeners) = {
      let mut inner = self.inner.lock();
      let query = inner.query.clone();
      let options = inner.options.clone();
      let next = create_result(&mut inner, &query, &options, mounted, false);
      inner.result_placeholder = options.placeholder_data.clone();

      let changed = next.changed_fields(&inner.result);
      if changed.is_empty() {
        return;
      }
      inner.result = next.clone();
      let notify_listeners = self.should_notify_listeners(&changed, options.query.config.notify_on_change_props.as_ref());
      (next, query, notify_listeners)
    };

    let query: Arc<dyn CachedQuery> = query;
    notify_manager().batch(|| {
      if notify_listeners {
        for listener in self.listeners.snapshot() {
          let result = result.clone();
          notify_manager().schedule(move || listener(&result));
        }
      }
      self
        .client
        .query_cache()
        .notify(QueryCacheEvent::ObserverResultsUpdated(query));
    });
  }

  fn should_notify_listeners(&self, changed: &[ResultField], props: Option<&NotifyOnChangeProps>) -> bool {
    match props {
      Some(NotifyOnChangeProps::All) => true,
      Some(NotifyOnChangeProps::Props(fields)) => changed.iter().any(|field| fields.contains(field)),
      Some(NotifyOnChangeProps::Tracked) => {
        let tracked = self.tracked.lock();
        changed.iter().any(|field| tracked.contains(field))
      }
      None => {
        let tracked = self.tracked.lock();
        tracked.is_empty() || changed.iter().any(|field| tracked.contains(field))
      }
    }
  }

  fn update_timers(&self) {
    self.update_stale_timeout();
    let interval = self.inner.lock().options.query.config.resolved_refetch_interval();
    self.update_refetch_interval(interval);
  }

  fn update_stale_timeout(&self) {
    let mut inner = self.inner.lock();
    inner.stale_timeout = None;
    let stale_time = inner.options.query.config.resolved_stale_time();
    if inner.result.is_stale || !is_finite(stale_time) {
      return;
    }
    // Fire just after the data turns stale.
    let delay = time_until_stale(inner.result.data_updated_at, stale_time) + Duration::from_millis(1);
    let me = self.me.clone();
    let spawner = self.client.query_cache().spawner().clone();
    inner.stale_timeout = Some(Timeout::schedule(spawner.as_ref(), delay, move || {
      if let Some(observer) = me.upgrade() {
        let stale = observer.inner.lock().result.is_stale;
        if !stale {
          observer.update_result();
        }
      }
    }));
  }

  fn update_refetch_interval(&self, interval: Option<Duration>) {
    let mut inner = self.inner.lock();
    inner.refetch_interval = None;
    inner.current_refetch_interval = interval;
    if !inner.options.query.config.is_enabled() {
      return;
    }
    let Some(period) = interval else {
      return;
    };
    let me = self.me.clone();
    let spawner = self.client.query_cache().spawner().clone();
    inner.refetch_interval = Some(Interval::schedule(spawner.as_ref(), period, move || {
      if let Some(observer) = me.upgrade() {
        let in_background = observer.inner.lock().options.query.config.refetches_in_background();
        if in_background || focus_manager().is_focused() {
          observer.execute_fetch_detached(FetchOptions::default());
        }
      }
    }));
  }

  fn execute_fetch(&self, fetch_options: FetchOptions) -> Result<QueryFuture<T>, QueryError> {
    let query = self.update_query()?;
    let options = self.inner.lock().options.query.clone();
    Ok(query.fetch(Some(options), fetch_options))
  }

  /// Starts a fetch whose outcome only matters through the query state.
  fn execute_fetch_detached(&self, fetch_options: FetchOptions) {
    if let Err(error) = self.execute_fetch(fetch_options) {
      tracing::debug!(error = %error, "background fetch not started");
    }
  }

  fn fetch(
    &self,
    fetch_options: FetchOptions,
    throw_on_error: bool,
  ) -> BoxFuture<'static, Result<QueryObserverResult<S>, QueryError>> {
    let promise = self.execute_fetch(fetch_options);
    let me = self.me.clone();
    async move {
      let outcome = promise?.await;
      if throw_on_error {
        outcome?;
      }
      match me.upgrade() {
        Some(observer) => {
          observer.update_result();
          let result = observer.inner.lock().result.clone();
          Ok(result)
        }
        None => Err(QueryError::from(crate::error::CancelledError {
          revert: false,
          silent: true,
        })),
      }
    }
    .boxed()
  }
}

impl<T: QueryData, S: QueryData> QueryObserverLink<T> for ObserverShared<T, S> {
  fn on_query_update(&self, _action: ActionKind) {
    self.update_result();
    if self.listeners.has_listeners() {
      self.update_timers();
    }
  }

  fn is_enabled(&self) -> bool {
    self.inner.lock().options.query.config.is_enabled()
  }

  fn is_result_stale(&self) -> bool {
    self.inner.lock().result.is_stale
  }

  fn should_fetch_on_window_focus(&self) -> bool {
    let (query, config) = {
      let inner = self.inner.lock();
      (inner.query.clone(), inner.options.query.config.clone())
    };
    should_fetch_on(&query, &config, config.resolved_refetch_on_window_focus())
  }

  fn should_fetch_on_reconnect(&self) -> bool {
    let (query, config) = {
      let inner = self.inner.lock();
      (inner.query.clone(), inner.options.query.config.clone())
    };
    should_fetch_on(&query, &config, config.resolved_refetch_on_reconnect())
  }

  fn refetch_in_background(&self) {
    self.execute_fetch_detached(FetchOptions {
      cancel_refetch: false,
      fetch_more: None,
    });
  }

  fn query_options(&self) -> QueryOptions<T> {
    self.inner.lock().options.query.clone()
  }
}
