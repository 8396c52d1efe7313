//! One asynchronous write and its lifecycle.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{CancelledError, QueryError};
use crate::key::QueryKey;
use crate::mutation_cache::{MutationCache, MutationCacheEvent};
use crate::notify::notify_manager;
use crate::removable::Removable;
use crate::retryer::{can_fetch, NetworkMode, Retry, RetryDelay, Retryer, RetryerConfig, RunFn, SharedResult};
use crate::runtime::TaskSpawner;
use crate::time::now_millis;

/// Values a mutation produces, consumes or carries as context.
pub trait MutationData: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> MutationData for T {}

/// The shared outcome of one mutation run.
pub type MutationFuture<D> = SharedResult<Arc<D>>;

pub type MutationFn<D, V> = Arc<dyn Fn(Arc<V>) -> BoxFuture<'static, Result<D, QueryError>> + Send + Sync>;
pub type OnMutateFn<V, C> = Arc<dyn Fn(Arc<V>) -> BoxFuture<'static, Result<C, QueryError>> + Send + Sync>;
pub type OnSuccessFn<D, V, C> = Arc<dyn Fn(&D, &V, Option<&C>) + Send + Sync>;
pub type OnErrorFn<V, C> = Arc<dyn Fn(&QueryError, &V, Option<&C>) + Send + Sync>;
pub type OnSettledFn<D, V, C> = Arc<dyn Fn(Option<&D>, Option<&QueryError>, &V, Option<&C>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

pub struct MutationState<D, V, C> {
  pub context: Option<Arc<C>>,
  pub data: Option<Arc<D>>,
  pub error: Option<QueryError>,
  pub failure_count: u32,
  pub failure_reason: Option<QueryError>,
  pub is_paused: bool,
  pub status: MutationStatus,
  pub variables: Option<Arc<V>>,
  /// Milliseconds since the UNIX epoch; 0 until submitted.
  pub submitted_at: u64,
}

impl<D, V, C> MutationState<D, V, C> {
  pub fn idle() -> Self {
    Self {
      context: None,
      data: None,
      error: None,
      failure_count: 0,
      failure_reason: None,
      is_paused: false,
      status: MutationStatus::Idle,
      variables: None,
      submitted_at: 0,
    }
  }
}

impl<D, V, C> Default for MutationState<D, V, C> {
  fn default() -> Self {
    Self::idle()
  }
}

impl<D, V, C> Clone for MutationState<D, V, C> {
  fn clone(&self) -> Self {
    Self {
      context: self.context.clone(),
      data: self.data.clone(),
      error: self.error.clone(),
      failure_count: self.failure_count,
      failure_reason: self.failure_reason.clone(),
      is_paused: self.is_paused,
      status: self.status,
      variables: self.variables.clone(),
      submitted_at: self.submitted_at,
    }
  }
}

impl<D, V, C> fmt::Debug for MutationState<D, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationState")
      .field("status", &self.status)
      .field("is_paused", &self.is_paused)
      .field("failure_count", &self.failure_count)
      .field("error", &self.error)
      .field("submitted_at", &self.submitted_at)
      .finish_non_exhaustive()
  }
}

/// Untyped mutation settings, layered like [`QueryConfig`](crate::QueryConfig).
#[derive(Debug, Clone, Default)]
pub struct MutationConfig {
  pub retry: Option<Retry>,
  pub retry_delay: Option<RetryDelay>,
  pub network_mode: Option<NetworkMode>,
  /// Finished, unobserved mutations are dropped after this long. Unset keeps
  /// them until removed.
  pub cache_time: Option<Duration>,
  pub meta: Option<Value>,
}

impl MutationConfig {
  pub fn merge(&self, overrides: &MutationConfig) -> MutationConfig {
    MutationConfig {
      retry: overrides.retry.clone().or_else(|| self.retry.clone()),
      retry_delay: overrides.retry_delay.clone().or_else(|| self.retry_delay.clone()),
      network_mode: overrides.network_mode.or(self.network_mode),
      cache_time: overrides.cache_time.or(self.cache_time),
      meta: overrides.meta.clone().or_else(|| self.meta.clone()),
    }
  }

  pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
    self.network_mode.unwrap_or_default()
  }
}

/// The definition of a mutation: its function and lifecycle callbacks.
pub struct MutationOptions<D, V, C = ()> {
  pub(crate) mutation_key: Option<QueryKey>,
  pub(crate) mutation_fn: Option<MutationFn<D, V>>,
  pub(crate) config: MutationConfig,
  pub(crate) on_mutate: Option<OnMutateFn<V, C>>,
  pub(crate) on_success: Option<OnSuccessFn<D, V, C>>,
  pub(crate) on_error: Option<OnErrorFn<V, C>>,
  pub(crate) on_settled: Option<OnSettledFn<D, V, C>>,
}

impl<D, V, C> Clone for MutationOptions<D, V, C> {
  fn clone(&self) -> Self {
    Self {
      mutation_key: self.mutation_key.clone(),
      mutation_fn: self.mutation_fn.clone(),
      config: self.config.clone(),
      on_mutate: self.on_mutate.clone(),
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
    }
  }
}

impl<D, V, C> Default for MutationOptions<D, V, C> {
  fn default() -> Self {
    Self {
      mutation_key: None,
      mutation_fn: None,
      config: MutationConfig::default(),
      on_mutate: None,
      on_success: None,
      on_error: None,
      on_settled: None,
    }
  }
}

impl<D, V, C> fmt::Debug for MutationOptions<D, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationOptions")
      .field("mutation_key", &self.mutation_key)
      .field("has_mutation_fn", &self.mutation_fn.is_some())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> MutationOptions<D, V, C> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn mutation_key(mut self, mutation_key: impl Into<QueryKey>) -> Self {
    self.mutation_key = Some(mutation_key.into());
    self
  }

  pub fn key(&self) -> Option<&QueryKey> {
    self.mutation_key.as_ref()
  }

  pub fn config(&self) -> &MutationConfig {
    &self.config
  }

  pub fn mutation_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, QueryError>> + Send + 'static,
  {
    self.mutation_fn = Some(Arc::new(move |variables| f(variables).boxed()));
    self
  }

  pub fn with_config(mut self, config: &MutationConfig) -> Self {
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

  pub fn meta(mut self, meta: Value) -> Self {
    self.config.meta = Some(meta);
    self
  }

  /// Runs before the mutation function; its output becomes the context
  /// handed to the other callbacks. A failure aborts the mutation.
  pub fn on_mutate<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Arc<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, QueryError>> + Send + 'static,
  {
    self.on_mutate = Some(Arc::new(move |variables| f(variables).boxed()));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&D, &V, Option<&C>) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&QueryError, &V, Option<&C>) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&D>, Option<&QueryError>, &V, Option<&C>) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }
}

/// What kind of transition a mutation went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationActionKind {
  Failed,
  Pending,
  Pause,
  Continue,
  Success,
  Error,
  SetState,
}

enum MutationAction<D, V, C> {
  Failed {
    failure_count: u32,
    error: QueryError,
  },
  Pending {
    variables: Arc<V>,
    context: Option<Arc<C>>,
    is_paused: bool,
    submitted_at: u64,
  },
  Pause,
  Continue,
  Success {
    data: Arc<D>,
  },
  Error {
    error: QueryError,
  },
  SetState {
    state: MutationState<D, V, C>,
  },
}

impl<D, V, C> MutationAction<D, V, C> {
  fn kind(&self) -> MutationActionKind {
    match self {
      MutationAction::Failed { .. } => MutationActionKind::Failed,
      MutationAction::Pending { .. } => MutationActionKind::Pending,
      MutationAction::Pause => MutationActionKind::Pause,
      MutationAction::Continue => MutationActionKind::Continue,
      MutationAction::Success { .. } => MutationActionKind::Success,
      MutationAction::Error { .. } => MutationActionKind::Error,
      MutationAction::SetState { .. } => MutationActionKind::SetState,
    }
  }
}

fn reduce<D, V, C>(state: &MutationState<D, V, C>, action: MutationAction<D, V, C>) -> MutationState<D, V, C> {
  match action {
    MutationAction::Failed { failure_count, error } => MutationState {
      failure_count,
      failure_reason: Some(error),
      ..state.clone()
    },
    MutationAction::Pause => MutationState {
      is_paused: true,
      ..state.clone()
    },
    MutationAction::Continue => MutationState {
      is_paused: false,
      ..state.clone()
    },
    MutationAction::Pending {
      variables,
      context,
      is_paused,
      submitted_at,
    } => MutationState {
      context,
      data: None,
      error: None,
      failure_count: 0,
      failure_reason: None,
      is_paused,
      status: MutationStatus::Pending,
      variables: Some(variables),
      submitted_at,
    },
    MutationAction::Success { data } => MutationState {
      data: Some(data),
      error: None,
      failure_count: 0,
      failure_reason: None,
      is_paused: false,
      status: MutationStatus::Success,
      ..state.clone()
    },
    MutationAction::Error { error } => MutationState {
      data: None,
      error: Some(error.clone()),
      failure_count: state.failure_count + 1,
      failure_reason: Some(error),
      is_paused: false,
      status: MutationStatus::Error,
      ..state.clone()
    },
    MutationAction::SetState { state } => state,
  }
}

/// The link from a mutation back to an observer tracking it.
pub(crate) trait MutationObserverLink<D, V, C>: Send + Sync {
  fn on_mutation_update(&self, action: MutationActionKind);
}

/// A mutation with its types erased, as stored by the [`MutationCache`].
pub trait CachedMutation: Send + Sync + 'static {
  fn mutation_id(&self) -> u64;
  fn mutation_key(&self) -> Option<&QueryKey>;
  fn status(&self) -> MutationStatus;
  fn is_paused(&self) -> bool;
  fn submitted_at(&self) -> u64;
  fn failure_count(&self) -> u32;
  fn observer_count(&self) -> usize;
  /// Resumes a paused run, or restarts a restored pending one. Resolves when
  /// the run settles.
  fn continue_execution(&self) -> BoxFuture<'static, Result<(), QueryError>>;
  fn destroy(&self);
  fn data_type_name(&self) -> &'static str;
  #[doc(hidden)]
  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn CachedMutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("mutation_id", &self.mutation_id())
      .field("mutation_key", &self.mutation_key())
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

struct ObserverEntry<D, V, C> {
  id: u64,
  link: Weak<dyn MutationObserverLink<D, V, C>>,
}

struct MutationInner<D, V, C> {
  options: MutationOptions<D, V, C>,
  state: MutationState<D, V, C>,
  observers: Vec<ObserverEntry<D, V, C>>,
  retryer: Option<Retryer<Arc<D>>>,
  execution: Option<MutationFuture<D>>,
}

pub struct Mutation<D: MutationData, V: MutationData, C: MutationData = ()> {
  me: Weak<Mutation<D, V, C>>,
  mutation_id: u64,
  mutation_key: Option<QueryKey>,
  cache: Weak<MutationCache>,
  spawner: Arc<dyn TaskSpawner>,
  gc: Removable,
  inner: Mutex<MutationInner<D, V, C>>,
}

fn resolved_cache_time(config: &MutationConfig) -> Duration {
  config.cache_time.unwrap_or(Duration::MAX)
}

impl<D: MutationData, V: MutationData, C: MutationData> Mutation<D, V, C> {
  pub(crate) fn new(
    cache: Weak<MutationCache>,
    spawner: Arc<dyn TaskSpawner>,
    mutation_id: u64,
    options: MutationOptions<D, V, C>,
    state: Option<MutationState<D, V, C>>,
  ) -> Arc<Self> {
    let cache_time = resolved_cache_time(&options.config);
    let mutation = Arc::new_cyclic(|me| Mutation {
      me: me.clone(),
      mutation_id,
      mutation_key: options.mutation_key.clone(),
      cache,
      spawner: spawner.clone(),
      gc: Removable::new(spawner),
      inner: Mutex::new(MutationInner {
        options,
        state: state.unwrap_or_default(),
        observers: Vec::new(),
        retryer: None,
        execution: None,
      }),
    });
    mutation.gc.update_cache_time(Some(cache_time));
    mutation.schedule_gc();
    mutation
  }

  pub fn mutation_id(&self) -> u64 {
    self.mutation_id
  }

  pub fn mutation_key(&self) -> Option<&QueryKey> {
    self.mutation_key.as_ref()
  }

  pub fn state(&self) -> MutationState<D, V, C> {
    self.inner.lock().state.clone()
  }

  pub fn options(&self) -> MutationOptions<D, V, C> {
    self.inner.lock().options.clone()
  }

  pub fn set_options(&self, options: MutationOptions<D, V, C>) {
    let cache_time = resolved_cache_time(&options.config);
    self.inner.lock().options = options;
    self.gc.update_cache_time(Some(cache_time));
  }

  pub fn set_state(&self, state: MutationState<D, V, C>) {
    self.dispatch(MutationAction::SetState { state });
  }

  /// Runs the mutation with `variables`. The run is driven on the task
  /// spawner, so it completes even when the returned future is dropped.
  pub fn execute(&self, variables: V) -> MutationFuture<D> {
    self.start(Some(Arc::new(variables)))
  }

  fn start(&self, variables: Option<Arc<V>>) -> MutationFuture<D> {
    let restored = variables.is_none();
    let variables = variables.or_else(|| self.inner.lock().state.variables.clone());
    let (Some(me), Some(variables)) = (self.me.upgrade(), variables) else {
      return future::ready(Err(QueryError::from(CancelledError {
        revert: false,
        silent: true,
      })))
      .boxed()
      .shared();
    };

    let pending = if restored {
      None
    } else {
      Some(me.submit(&variables))
    };
    let execution = me.run(variables, pending).boxed().shared();
    self.inner.lock().execution = Some(execution.clone());
    let driver = execution.clone();
    self.spawner.spawn(Box::pin(async move {
      let _ = driver.await;
    }));
    execution
  }

  /// Moves the mutation to pending and tells the cache. Returns the pause
  /// flag and submission time for later re-dispatches.
  fn submit(self: &Arc<Self>, variables: &Arc<V>) -> (bool, u64) {
    let is_paused = !can_fetch(self.inner.lock().options.config.resolved_network_mode());
    let submitted_at = now_millis();
    tracing::debug!(mutation_id = self.mutation_id, is_paused, "mutation started");
    self.dispatch(MutationAction::Pending {
      variables: variables.clone(),
      context: None,
      is_paused,
      submitted_at,
    });
    if let Some(cache) = self.cache.upgrade() {
      cache.on_mutation_start(self.as_ref());
    }
    (is_paused, submitted_at)
  }

  async fn run(self: Arc<Self>, variables: Arc<V>, pending: Option<(bool, u64)>) -> Result<Arc<D>, QueryError> {
    let options = self.options();
    let erased: Arc<dyn CachedMutation> = self.clone();

    if let (Some((is_paused, submitted_at)), Some(on_mutate)) = (pending, &options.on_mutate) {
      match on_mutate(variables.clone()).await {
        Ok(context) => self.dispatch(MutationAction::Pending {
          variables: variables.clone(),
          context: Some(Arc::new(context)),
          is_paused,
          submitted_at,
        }),
        Err(error) => {
          self.settle_error(&options, &erased, &variables, error.clone());
          return Err(error);
        }
      }
    }

    let retryer = Retryer::new(self.retryer_config(&options, variables.clone()));
    self.inner.lock().retryer = Some(retryer.clone());
    let outcome = retryer.promise().await;

    match outcome {
      Ok(data) => {
        let context = self.inner.lock().state.context.clone();
        let cache = self.cache.upgrade();
        if let Some(cache) = &cache {
          cache.on_mutation_success(erased.as_ref());
        }
        if let Some(on_success) = &options.on_success {
          on_success(&data, &variables, context.as_deref());
        }
        if let Some(cache) = &cache {
          cache.on_mutation_settled(None, erased.as_ref());
        }
        if let Some(on_settled) = &options.on_settled {
          on_settled(Some(&data), None, &variables, context.as_deref());
        }
        self.dispatch(MutationAction::Success { data: data.clone() });
        Ok(data)
      }
      Err(error) => {
        self.settle_error(&options, &erased, &variables, error.clone());
        Err(error)
      }
    }
  }

  fn settle_error(
    &self,
    options: &MutationOptions<D, V, C>,
    erased: &Arc<dyn CachedMutation>,
    variables: &Arc<V>,
    error: QueryError,
  ) {
    tracing::debug!(mutation_id = self.mutation_id, error = %error, "mutation failed");
    let context = self.inner.lock().state.context.clone();
    let cache = self.cache.upgrade();
    if let Some(cache) = &cache {
      cache.on_mutation_error(&error, erased.as_ref());
    }
    if let Some(on_error) = &options.on_error {
      on_error(&error, variables, context.as_deref());
    }
    if let Some(cache) = &cache {
      cache.on_mutation_settled(Some(&error), erased.as_ref());
    }
    if let Some(on_settled) = &options.on_settled {
      on_settled(None, Some(&error), variables, context.as_deref());
    }
    self.dispatch(MutationAction::Error { error });
  }

  fn retryer_config(&self, options: &MutationOptions<D, V, C>, variables: Arc<V>) -> RetryerConfig<Arc<D>> {
    let mutation_fn = options.mutation_fn.clone();
    let run: RunFn<Arc<D>> = Arc::new(move || match &mutation_fn {
      Some(mutation_fn) => mutation_fn(variables.clone()).map(|result| result.map(Arc::new)).boxed(),
      None => future::ready(Err(QueryError::MissingMutationFn)).boxed(),
    });

    let mut config = RetryerConfig::new(run);
    config.retry = options.config.retry.clone().unwrap_or(Retry::Never);
    config.retry_delay = options.config.retry_delay.clone().unwrap_or_default();
    config.network_mode = options.config.resolved_network_mode();

    let me = self.me.clone();
    config.on_fail = Some(Box::new(move |failure_count, error| {
      if let Some(mutation) = me.upgrade() {
        mutation.dispatch(MutationAction::Failed {
          failure_count,
          error: error.clone(),
        });
      }
    }));
    let me = self.me.clone();
    config.on_pause = Some(Box::new(move || {
      if let Some(mutation) = me.upgrade() {
        tracing::debug!(mutation_id = mutation.mutation_id, "mutation paused");
        mutation.dispatch(MutationAction::Pause);
      }
    }));
    let me = self.me.clone();
    config.on_continue = Some(Box::new(move || {
      if let Some(mutation) = me.upgrade() {
        mutation.dispatch(MutationAction::Continue);
      }
    }));
    config
  }

  /// Wakes a paused run, or restarts a pending one that has no run.
  pub fn continue_execution(&self) -> MutationFuture<D> {
    let (retryer, execution) = {
      let inner = self.inner.lock();
      (inner.retryer.clone(), inner.execution.clone())
    };
    if let Some(retryer) = retryer {
      retryer.continue_execution();
    }
    match execution {
      Some(execution) => execution,
      None => self.start(None),
    }
  }

  pub(crate) fn add_observer(&self, id: u64, link: Weak<dyn MutationObserverLink<D, V, C>>) {
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
      self.notify_cache(MutationCacheEvent::ObserverAdded);
    }
  }

  pub(crate) fn remove_observer(&self, id: u64) {
    let removed = {
      let mut inner = self.inner.lock();
      let before = inner.observers.len();
      inner.observers.retain(|entry| entry.id != id);
      inner.observers.len() != before
    };
    if removed {
      self.schedule_gc();
      self.notify_cache(MutationCacheEvent::ObserverRemoved);
    }
  }

  pub fn observer_count(&self) -> usize {
    self.inner.lock().observers.len()
  }

  pub fn destroy(&self) {
    self.gc.clear_gc_timeout();
  }

  fn schedule_gc(&self) {
    let me = self.me.clone();
    self.gc.schedule_gc(move || {
      if let Some(mutation) = me.upgrade() {
        mutation.optional_remove();
      }
    });
  }

  fn optional_remove(&self) {
    let (unobserved, pending) = {
      let inner = self.inner.lock();
      (inner.observers.is_empty(), inner.state.status == MutationStatus::Pending)
    };
    if !unobserved {
      return;
    }
    if pending {
      self.schedule_gc();
      return;
    }
    if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
      tracing::debug!(mutation_id = self.mutation_id, "removing finished mutation");
      let me: Arc<dyn CachedMutation> = me;
      cache.remove(&me);
    }
  }

  fn dispatch(&self, action: MutationAction<D, V, C>) {
    let kind = action.kind();
    let observers: Vec<_> = {
      let mut inner = self.inner.lock();
      inner.state = reduce(&inner.state, action);
      inner.observers.iter().filter_map(|entry| entry.link.upgrade()).collect()
    };
    notify_manager().batch(|| {
      for observer in &observers {
        observer.on_mutation_update(kind);
      }
      if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
        cache.notify(MutationCacheEvent::Updated {
          mutation: me,
          action: kind,
        });
      }
    });
  }

  fn notify_cache(&self, event: fn(Arc<dyn CachedMutation>) -> MutationCacheEvent) {
    if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
      cache.notify(event(me));
    }
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> CachedMutation for Mutation<D, V, C> {
  fn mutation_id(&self) -> u64 {
    self.mutation_id
  }

  fn mutation_key(&self) -> Option<&QueryKey> {
    self.mutation_key.as_ref()
  }

  fn status(&self) -> MutationStatus {
    self.inner.lock().state.status
  }

  fn is_paused(&self) -> bool {
    self.inner.lock().state.is_paused
  }

  fn submitted_at(&self) -> u64 {
    self.inner.lock().state.submitted_at
  }

  fn failure_count(&self) -> u32 {
    self.inner.lock().state.failure_count
  }

  fn observer_count(&self) -> usize {
    Mutation::observer_count(self)
  }

  fn continue_execution(&self) -> BoxFuture<'static, Result<(), QueryError>> {
    Mutation::continue_execution(self).map(|result| result.map(|_| ())).boxed()
  }

  fn destroy(&self) {
    Mutation::destroy(self)
  }

  fn data_type_name(&self) -> &'static str {
    std::any::type_name::<D>()
  }

  fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> fmt::Debug for Mutation<D, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Mutation")
      .field("mutation_id", &self.mutation_id)
      .field("mutation_key", &self.mutation_key)
      .field("state", &inner.state)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  type State = MutationState<u32, String, ()>;

  #[test]
  fn pending_clears_previous_outcome() {
    let errored = reduce(
      &State::idle(),
      MutationAction::Error {
        error: QueryError::fetch("boom"),
      },
    );
    assert_eq!(errored.status, MutationStatus::Error);
    assert_eq!(errored.failure_count, 1);

    let pending = reduce(
      &errored,
      MutationAction::Pending {
        variables: Arc::new("v".to_string()),
        context: None,
        is_paused: true,
        submitted_at: 42,
      },
    );
    assert_eq!(pending.status, MutationStatus::Pending);
    assert!(pending.error.is_none());
    assert_eq!(pending.failure_count, 0);
    assert!(pending.is_paused);
    assert_eq!(pending.submitted_at, 42);
    assert_eq!(pending.variables.as_deref().map(String::as_str), Some("v"));
  }

  #[test]
  fn success_keeps_variables_and_unpauses() {
    let pending = reduce(
      &State::idle(),
      MutationAction::Pending {
        variables: Arc::new("v".to_string()),
        context: None,
        is_paused: true,
        submitted_at: 1,
      },
    );
    let done = reduce(&pending, MutationAction::Success { data: Arc::new(7) });
    assert_eq!(done.status, MutationStatus::Success);
    assert_eq!(done.data.as_deref(), Some(&7));
    assert!(!done.is_paused);
    assert!(done.variables.is_some());
  }

  #[test]
  fn config_merge_prefers_overrides() {
    let base = MutationConfig {
      retry: Some(Retry::Count(2)),
      network_mode: Some(NetworkMode::Always),
      ..MutationConfig::default()
    };
    let merged = base.merge(&MutationConfig {
      network_mode: Some(NetworkMode::OfflineFirst),
      ..MutationConfig::default()
    });
    assert!(matches!(merged.retry, Some(Retry::Count(2))));
    assert_eq!(merged.network_mode, Some(NetworkMode::OfflineFirst));
  }
}
