//! Option records for queries and observers.
//!
//! Options come in two layers: a partial, untyped [`QueryConfig`] whose fields
//! are all optional (used for global and per-key defaults), and the typed
//! [`QueryOptions`] that carries the key, the function and a config. Defaults
//! merge global → per-key → per-call, later layers winning field by field.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::ResultField;
use crate::query::QueryBehavior;
use crate::retryer::{NetworkMode, Retry, RetryDelay};

/// Data that can live in the cache.
///
/// Equality drives structural sharing: a refetch that produces an equal value
/// keeps the previous `Arc`, so consumers can compare by pointer.
pub trait QueryData: PartialEq + Send + Sync + 'static {}

impl<T: PartialEq + Send + Sync + 'static> QueryData for T {}

pub type QueryFn<T> =
  Arc<dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum FetchDirection {
  Forward,
  Backward,
}

/// What a query function receives.
#[derive(Clone)]
pub struct QueryFunctionContext<P = ()> {
  pub query_key: QueryKey,
  pub meta: Option<Value>,
  pub page_param: P,
  pub direction: Option<FetchDirection>,
  signal: CancellationToken,
  signal_consumed: Arc<AtomicBool>,
}

impl QueryFunctionContext<()> {
  pub(crate) fn new(
    query_key: QueryKey,
    meta: Option<Value>,
    signal: CancellationToken,
    signal_consumed: Arc<AtomicBool>,
  ) -> Self {
    Self {
      query_key,
      meta,
      page_param: (),
      direction: None,
      signal,
      signal_consumed,
    }
  }
}

impl<P> QueryFunctionContext<P> {
  /// The cancellation signal for this fetch.
  ///
  /// Reading it tells the query that the function honours cancellation, so
  /// losing the last observer cancels the fetch and reverts its state.
  pub fn signal(&self) -> CancellationToken {
    self.signal_consumed.store(true, Ordering::SeqCst);
    self.signal.clone()
  }

  pub(crate) fn with_page<Q>(&self, page_param: Q, direction: Option<FetchDirection>) -> QueryFunctionContext<Q> {
    QueryFunctionContext {
      query_key: self.query_key.clone(),
      meta: self.meta.clone(),
      page_param,
      direction,
      signal: self.signal.clone(),
      signal_consumed: self.signal_consumed.clone(),
    }
  }
}

impl<P: fmt::Debug> fmt::Debug for QueryFunctionContext<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryFunctionContext")
      .field("query_key", &self.query_key)
      .field("page_param", &self.page_param)
      .field("direction", &self.direction)
      .finish_non_exhaustive()
  }
}

/// When an observer refetches in response to mount, focus or reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchOn {
  Never,
  #[default]
  IfStale,
  Always,
}

impl From<bool> for RefetchOn {
  fn from(enabled: bool) -> Self {
    if enabled {
      RefetchOn::IfStale
    } else {
      RefetchOn::Never
    }
  }
}

/// Which result field changes wake an observer's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOnChangeProps {
  All,
  Props(Vec<ResultField>),
  /// Only the fields read through `QueryObserver::track_result`.
  Tracked,
}

/// A partial set of query options. `None` means "inherit".
#[derive(Clone, Default)]
pub struct QueryConfig {
  pub retry: Option<Retry>,
  pub retry_delay: Option<RetryDelay>,
  pub network_mode: Option<NetworkMode>,
  /// How long an unused query is kept. `Duration::MAX` keeps it forever.
  pub cache_time: Option<Duration>,
  /// How long fetched data counts as fresh. `Duration::MAX` never goes stale.
  pub stale_time: Option<Duration>,
  pub enabled: Option<bool>,
  pub refetch_on_mount: Option<RefetchOn>,
  pub refetch_on_window_focus: Option<RefetchOn>,
  pub refetch_on_reconnect: Option<RefetchOn>,
  pub refetch_interval: Option<Duration>,
  pub refetch_interval_in_background: Option<bool>,
  pub retry_on_mount: Option<bool>,
  pub structural_sharing: Option<bool>,
  pub keep_previous_data: Option<bool>,
  pub notify_on_change_props: Option<NotifyOnChangeProps>,
  pub suspense: Option<bool>,
  pub meta: Option<Value>,
}

impl QueryConfig {
  /// Layers `overrides` on top of `self`.
  pub fn merge(&self, overrides: &QueryConfig) -> QueryConfig {
    QueryConfig {
      retry: overrides.retry.clone().or_else(|| self.retry.clone()),
      retry_delay: overrides.retry_delay.clone().or_else(|| self.retry_delay.clone()),
      network_mode: overrides.network_mode.or(self.network_mode),
      cache_time: overrides.cache_time.or(self.cache_time),
      stale_time: overrides.stale_time.or(self.stale_time),
      enabled: overrides.enabled.or(self.enabled),
      refetch_on_mount: overrides.refetch_on_mount.or(self.refetch_on_mount),
      refetch_on_window_focus: overrides.refetch_on_window_focus.or(self.refetch_on_window_focus),
      refetch_on_reconnect: overrides.refetch_on_reconnect.or(self.refetch_on_reconnect),
      refetch_interval: overrides.refetch_interval.or(self.refetch_interval),
      refetch_interval_in_background: overrides
        .refetch_interval_in_background
        .or(self.refetch_interval_in_background),
      retry_on_mount: overrides.retry_on_mount.or(self.retry_on_mount),
      structural_sharing: overrides.structural_sharing.or(self.structural_sharing),
      keep_previous_data: overrides.keep_previous_data.or(self.keep_previous_data),
      notify_on_change_props: overrides
        .notify_on_change_props
        .clone()
        .or_else(|| self.notify_on_change_props.clone()),
      suspense: overrides.suspense.or(self.suspense),
      meta: overrides.meta.clone().or_else(|| self.meta.clone()),
    }
  }

  pub(crate) fn retry_or(&self, default: Retry) -> Retry {
    self.retry.clone().unwrap_or(default)
  }

  pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
    self.retry_delay.clone().unwrap_or_default()
  }

  pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
    self.network_mode.unwrap_or_default()
  }

  pub(crate) fn resolved_stale_time(&self) -> Duration {
    self.stale_time.unwrap_or(Duration::ZERO)
  }

  pub(crate) fn is_enabled(&self) -> bool {
    self.enabled.unwrap_or(true)
  }

  pub(crate) fn resolved_refetch_on_mount(&self) -> RefetchOn {
    self.refetch_on_mount.unwrap_or_default()
  }

  pub(crate) fn resolved_refetch_on_window_focus(&self) -> RefetchOn {
    self.refetch_on_window_focus.unwrap_or_default()
  }

  pub(crate) fn resolved_refetch_on_reconnect(&self) -> RefetchOn {
    self.refetch_on_reconnect.unwrap_or_default()
  }

  pub(crate) fn resolved_refetch_interval(&self) -> Option<Duration> {
    self.refetch_interval.filter(|interval| !interval.is_zero())
  }

  pub(crate) fn refetches_in_background(&self) -> bool {
    self.refetch_interval_in_background.unwrap_or(false)
  }

  pub(crate) fn retries_on_mount(&self) -> bool {
    self.retry_on_mount.unwrap_or(true)
  }

  pub(crate) fn shares_structure(&self) -> bool {
    self.structural_sharing.unwrap_or(true)
  }

  pub(crate) fn keeps_previous_data(&self) -> bool {
    self.keep_previous_data.unwrap_or(false)
  }

  pub(crate) fn is_suspense(&self) -> bool {
    self.suspense.unwrap_or(false)
  }
}

impl fmt::Debug for QueryConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryConfig")
      .field("retry", &self.retry)
      .field("network_mode", &self.network_mode)
      .field("cache_time", &self.cache_time)
      .field("stale_time", &self.stale_time)
      .field("enabled", &self.enabled)
      .field("refetch_interval", &self.refetch_interval)
      .finish_non_exhaustive()
  }
}

/// Seed data for a query that has never been fetched.
pub enum InitialData<T> {
  Value(Arc<T>),
  Lazy(Arc<dyn Fn() -> Option<T> + Send + Sync>),
}

impl<T> InitialData<T> {
  pub(crate) fn resolve(&self) -> Option<Arc<T>> {
    match self {
      InitialData::Value(value) => Some(value.clone()),
      InitialData::Lazy(f) => f().map(Arc::new),
    }
  }
}

impl<T> Clone for InitialData<T> {
  fn clone(&self) -> Self {
    match self {
      InitialData::Value(value) => InitialData::Value(value.clone()),
      InitialData::Lazy(f) => InitialData::Lazy(f.clone()),
    }
  }
}

/// Options for one query: identity, function, config and seed data.
pub struct QueryOptions<T> {
  pub(crate) query_key: QueryKey,
  pub(crate) query_hash: Option<String>,
  pub(crate) query_fn: Option<QueryFn<T>>,
  pub(crate) config: QueryConfig,
  pub(crate) initial_data: Option<InitialData<T>>,
  pub(crate) initial_data_updated_at: Option<u64>,
  pub(crate) behavior: Option<Arc<dyn QueryBehavior<T>>>,
}

impl<T> Clone for QueryOptions<T> {
  fn clone(&self) -> Self {
    Self {
      query_key: self.query_key.clone(),
      query_hash: self.query_hash.clone(),
      query_fn: self.query_fn.clone(),
      config: self.config.clone(),
      initial_data: self.initial_data.clone(),
      initial_data_updated_at: self.initial_data_updated_at,
      behavior: self.behavior.clone(),
    }
  }
}

impl<T> fmt::Debug for QueryOptions<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("query_key", &self.query_key)
      .field("has_query_fn", &self.query_fn.is_some())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl<T: QueryData> QueryOptions<T> {
  pub fn new(query_key: impl Into<QueryKey>) -> Self {
    Self {
      query_key: query_key.into(),
      query_hash: None,
      query_fn: None,
      config: QueryConfig::default(),
      initial_data: None,
      initial_data_updated_at: None,
      behavior: None,
    }
  }

  pub fn query_key(&self) -> &QueryKey {
    &self.query_key
  }

  pub fn query_hash(&self) -> String {
    self
      .query_hash
      .clone()
      .unwrap_or_else(|| self.query_key.hash_key())
  }

  pub fn config(&self) -> &QueryConfig {
    &self.config
  }

  pub fn has_query_fn(&self) -> bool {
    self.query_fn.is_some()
  }

  pub fn query_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    self.query_fn = Some(Arc::new(move |context| f(context).boxed()));
    self
  }

  /// Layers `config` over what is already set.
  pub fn with_config(mut self, config: &QueryConfig) -> Self {
    self.config = self.config.merge(config);
    self
  }

  pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
    self.config.retry = Some(retry.into());
    self
  }

  pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
    self.config.retry_delay = Some(retry_delay.into());
    self
  }

  pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
    self.config.network_mode = Some(network_mode);
    self
  }

  pub fn cache_time(mut self, cache_time: Duration) -> Self {
    self.config.cache_time = Some(cache_time);
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.config.stale_time = Some(stale_time);
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.config.enabled = Some(enabled);
    self
  }

  pub fn refetch_on_mount(mut self, refetch: impl Into<RefetchOn>) -> Self {
    self.config.refetch_on_mount = Some(refetch.into());
    self
  }

  pub fn refetch_on_window_focus(mut self, refetch: impl Into<RefetchOn>) -> Self {
    self.config.refetch_on_window_focus = Some(refetch.into());
    self
  }

  pub fn refetch_on_reconnect(mut self, refetch: impl Into<RefetchOn>) -> Self {
    self.config.refetch_on_reconnect = Some(refetch.into());
    self
  }

  pub fn refetch_interval(mut self, interval: Duration) -> Self {
    self.config.refetch_interval = Some(interval);
    self
  }

  pub fn refetch_interval_in_background(mut self, enabled: bool) -> Self {
    self.config.refetch_interval_in_background = Some(enabled);
    self
  }

  pub fn retry_on_mount(mut self, enabled: bool) -> Self {
    self.config.retry_on_mount = Some(enabled);
    self
  }

  pub fn structural_sharing(mut self, enabled: bool) -> Self {
    self.config.structural_sharing = Some(enabled);
    self
  }

  pub fn keep_previous_data(mut self, enabled: bool) -> Self {
    self.config.keep_previous_data = Some(enabled);
    self
  }

  pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
    self.config.notify_on_change_props = Some(props);
    self
  }

  pub fn suspense(mut self, enabled: bool) -> Self {
    self.config.suspense = Some(enabled);
    self
  }

  pub fn meta(mut self, meta: Value) -> Self {
    self.config.meta = Some(meta);
    self
  }

  pub fn initial_data(mut self, data: T) -> Self {
    self.initial_data = Some(InitialData::Value(Arc::new(data)));
    self
  }

  /// Seed data computed when the query entry is created.
  pub fn initial_data_with(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
    self.initial_data = Some(InitialData::Lazy(Arc::new(f)));
    self
  }

  /// Timestamp (ms since the UNIX epoch) the initial data was produced at.
  pub fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
    self.initial_data_updated_at = Some(updated_at);
    self
  }

  /// Installs a fetch strategy that replaces the plain query function.
  pub fn behavior(mut self, behavior: Arc<dyn QueryBehavior<T>>) -> Self {
    self.behavior = Some(behavior);
    self
  }
}

/// Data shown while a query has nothing to show yet. Never cached.
pub enum PlaceholderData<T> {
  Value(Arc<T>),
  Lazy(Arc<dyn Fn() -> Option<T> + Send + Sync>),
}

impl<T> Clone for PlaceholderData<T> {
  fn clone(&self) -> Self {
    match self {
      PlaceholderData::Value(value) => PlaceholderData::Value(value.clone()),
      PlaceholderData::Lazy(f) => PlaceholderData::Lazy(f.clone()),
    }
  }
}

impl<T> PlaceholderData<T> {
  pub(crate) fn same_source(&self, other: &PlaceholderData<T>) -> bool {
    match (self, other) {
      (PlaceholderData::Value(a), PlaceholderData::Value(b)) => Arc::ptr_eq(a, b),
      (PlaceholderData::Lazy(a), PlaceholderData::Lazy(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }

  pub(crate) fn resolve(&self) -> Option<Arc<T>> {
    match self {
      PlaceholderData::Value(value) => Some(value.clone()),
      PlaceholderData::Lazy(f) => f().map(Arc::new),
    }
  }
}

/// Projection from cached data to what an observer exposes.
pub(crate) enum Selector<T, S> {
  Identity(fn(Arc<T>) -> Arc<S>),
  Map(Arc<dyn Fn(&T) -> S + Send + Sync>),
}

impl<T, S> Clone for Selector<T, S> {
  fn clone(&self) -> Self {
    match self {
      Selector::Identity(f) => Selector::Identity(*f),
      Selector::Map(f) => Selector::Map(f.clone()),
    }
  }
}

impl<T, S> Selector<T, S> {
  pub(crate) fn same_as(&self, other: &Selector<T, S>) -> bool {
    match (self, other) {
      (Selector::Identity(_), Selector::Identity(_)) => true,
      (Selector::Map(a), Selector::Map(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }

  pub(crate) fn is_identity(&self) -> bool {
    matches!(self, Selector::Identity(_))
  }

  pub(crate) fn apply(&self, data: Arc<T>) -> Arc<S> {
    match self {
      Selector::Identity(f) => f(data),
      Selector::Map(f) => Arc::new(f(&data)),
    }
  }
}

fn identity<T>(data: Arc<T>) -> Arc<T> {
  data
}

/// Options for a [`QueryObserver`](crate::QueryObserver): the query options
/// plus the observer-only `select` projection and placeholder data.
pub struct QueryObserverOptions<T, S = T> {
  pub(crate) query: QueryOptions<T>,
  pub(crate) select: Selector<T, S>,
  pub(crate) placeholder_data: Option<PlaceholderData<T>>,
}

impl<T, S> Clone for QueryObserverOptions<T, S> {
  fn clone(&self) -> Self {
    Self {
      query: self.query.clone(),
      select: self.select.clone(),
      placeholder_data: self.placeholder_data.clone(),
    }
  }
}

impl<T: QueryData> From<QueryOptions<T>> for QueryObserverOptions<T, T> {
  fn from(query: QueryOptions<T>) -> Self {
    Self {
      query,
      select: Selector::Identity(identity::<T>),
      placeholder_data: None,
    }
  }
}

impl<T: QueryData, S: QueryData> QueryObserverOptions<T, S> {
  pub fn query_options(&self) -> &QueryOptions<T> {
    &self.query
  }

  pub fn query_hash(&self) -> String {
    self.query.query_hash()
  }

  /// Maps the cached data before it reaches the observer. The mapped value is
  /// memoized per source value and structurally shared.
  pub fn select<S2: QueryData>(self, f: impl Fn(&T) -> S2 + Send + Sync + 'static) -> QueryObserverOptions<T, S2> {
    QueryObserverOptions {
      query: self.query,
      select: Selector::Map(Arc::new(f)),
      placeholder_data: self.placeholder_data,
    }
  }

  pub fn placeholder_data(mut self, data: T) -> Self {
    self.placeholder_data = Some(PlaceholderData::Value(Arc::new(data)));
    self
  }

  pub fn placeholder_data_with(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
    self.placeholder_data = Some(PlaceholderData::Lazy(Arc::new(f)));
    self
  }

  /// Adjusts the wrapped query options.
  pub fn map_query(mut self, f: impl FnOnce(QueryOptions<T>) -> QueryOptions<T>) -> Self {
    self.query = f(self.query);
    self
  }
}

/// An explicit request to fetch one more page of an infinite query.
#[derive(Clone)]
pub struct FetchMore {
  pub direction: FetchDirection,
  /// Overrides the computed page parameter. Must hold the page param type.
  pub page_param: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for FetchMore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchMore")
      .field("direction", &self.direction)
      .field("has_page_param", &self.page_param.is_some())
      .finish()
  }
}

/// Per-call fetch switches.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  /// Replace an in-flight fetch instead of joining it (only once data exists).
  pub cancel_refetch: bool,
  pub fetch_more: Option<FetchMore>,
}

/// Options for refetch-style operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchOptions {
  pub cancel_refetch: bool,
  /// Surface the first failure instead of swallowing it.
  pub throw_on_error: bool,
}

impl Default for RefetchOptions {
  fn default() -> Self {
    Self {
      cancel_refetch: true,
      throw_on_error: false,
    }
  }
}

impl From<RefetchOptions> for FetchOptions {
  fn from(options: RefetchOptions) -> Self {
    FetchOptions {
      cancel_refetch: options.cancel_refetch,
      fetch_more: None,
    }
  }
}

/// Which invalidated queries are refetched right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchType {
  #[default]
  Active,
  Inactive,
  All,
  None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateOptions {
  pub refetch_type: RefetchType,
  pub cancel_refetch: bool,
  pub throw_on_error: bool,
}

impl Default for InvalidateOptions {
  fn default() -> Self {
    Self {
      refetch_type: RefetchType::Active,
      cancel_refetch: true,
      throw_on_error: false,
    }
  }
}

/// Options for writing data directly into a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetDataOptions {
  /// Timestamp to record instead of "now".
  pub updated_at: Option<u64>,
  /// A manual write keeps the current fetch state untouched.
  pub manual: bool,
}
