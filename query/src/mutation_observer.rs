use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::mutation::{
  CachedMutation, Mutation, MutationActionKind, MutationData, MutationObserverLink, MutationOptions, MutationState,
  MutationStatus, OnErrorFn, OnSettledFn, OnSuccessFn,
};
use crate::mutation_cache::MutationCacheEvent;
use crate::notify::notify_manager;
use crate::subscribable::{ListenerId, Subscribable};

/// Callbacks for a single `mutate` call. They run after the definition's own
/// callbacks, and only while the observer still tracks that call.
pub struct MutateOptions<D, V, C = ()> {
  pub(crate) on_success: Option<OnSuccessFn<D, V, C>>,
  pub(crate) on_error: Option<OnErrorFn<V, C>>,
  pub(crate) on_settled: Option<OnSettledFn<D, V, C>>,
}

impl<D, V, C> Default for MutateOptions<D, V, C> {
  fn default() -> Self {
    Self {
      on_success: None,
      on_error: None,
      on_settled: None,
    }
  }
}

impl<D, V, C> Clone for MutateOptions<D, V, C> {
  fn clone(&self) -> Self {
    Self {
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
    }
  }
}

impl<D, V, C> MutateOptions<D, V, C> {
  pub fn new() -> Self {
    Self::default()
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

/// The state of the tracked mutation, as seen by an observer.
pub struct MutationObserverResult<D, V, C> {
  pub state: MutationState<D, V, C>,
  /// Id of the tracked mutation, if any.
  pub mutation_id: Option<u64>,
}

impl<D, V, C> Clone for MutationObserverResult<D, V, C> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
      mutation_id: self.mutation_id,
    }
  }
}

impl<D, V, C> fmt::Debug for MutationObserverResult<D, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationObserverResult")
      .field("mutation_id", &self.mutation_id)
      .field("state", &self.state)
      .finish()
  }
}

impl<D, V, C> MutationObserverResult<D, V, C> {
  pub fn data(&self) -> Option<&Arc<D>> {
    self.state.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.state.error.as_ref()
  }

  pub fn variables(&self) -> Option<&Arc<V>> {
    self.state.variables.as_ref()
  }

  pub fn status(&self) -> MutationStatus {
    self.state.status
  }

  pub fn is_idle(&self) -> bool {
    self.state.status == MutationStatus::Idle
  }

  pub fn is_pending(&self) -> bool {
    self.state.status == MutationStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.state.status == MutationStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.state.status == MutationStatus::Error
  }

  pub fn is_paused(&self) -> bool {
    self.state.is_paused
  }
}

static NEXT_MUTATION_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type ResultListener<D, V, C> = dyn Fn(&MutationObserverResult<D, V, C>) + Send + Sync;

struct ObserverInner<D: MutationData, V: MutationData, C: MutationData> {
  options: MutationOptions<D, V, C>,
  current: Option<Arc<Mutation<D, V, C>>>,
  mutate_options: Option<MutateOptions<D, V, C>>,
  result: MutationObserverResult<D, V, C>,
}

struct ObserverShared<D: MutationData, V: MutationData, C: MutationData> {
  id: u64,
  me: Weak<ObserverShared<D, V, C>>,
  client: QueryClient,
  listeners: Subscribable<ResultListener<D, V, C>>,
  inner: Mutex<ObserverInner<D, V, C>>,
}

/// Runs mutations from one definition and follows the latest one.
pub struct MutationObserver<D: MutationData, V: MutationData, C: MutationData = ()> {
  shared: Arc<ObserverShared<D, V, C>>,
}

impl<D: MutationData, V: MutationData, C: MutationData> MutationObserver<D, V, C> {
  pub fn new(client: &QueryClient, options: MutationOptions<D, V, C>) -> Self {
    let options = client.default_mutation_options(options);
    let shared = Arc::new_cyclic(|me| ObserverShared {
      id: NEXT_MUTATION_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
      me: me.clone(),
      client: client.clone(),
      listeners: Subscribable::new(),
      inner: Mutex::new(ObserverInner {
        options,
        current: None,
        mutate_options: None,
        result: MutationObserverResult {
          state: MutationState::idle(),
          mutation_id: None,
        },
      }),
    });
    Self { shared }
  }

  pub fn subscribe(&self, listener: impl Fn(&MutationObserverResult<D, V, C>) + Send + Sync + 'static) -> ListenerId {
    self.shared.listeners.subscribe(Arc::new(listener))
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.shared.listeners.unsubscribe(id);
    if !self.shared.listeners.has_listeners() {
      self.shared.detach();
    }
  }

  pub fn has_listeners(&self) -> bool {
    self.shared.listeners.has_listeners()
  }

  pub fn set_options(&self, options: MutationOptions<D, V, C>) {
    let options = self.shared.client.default_mutation_options(options);
    let current = {
      let mut inner = self.shared.inner.lock();
      inner.options = options.clone();
      inner.current.clone()
    };
    if let Some(mutation) = current {
      mutation.set_options(options);
      let erased: Arc<dyn CachedMutation> = mutation;
      self
        .shared
        .client
        .mutation_cache()
        .notify(MutationCacheEvent::ObserverOptionsUpdated(erased));
    }
  }

  pub fn current_result(&self) -> MutationObserverResult<D, V, C> {
    self.shared.inner.lock().result.clone()
  }

  pub fn current_mutation(&self) -> Option<Arc<Mutation<D, V, C>>> {
    self.shared.inner.lock().current.clone()
  }

  /// Starts a mutation and forgets about its outcome; read it from the
  /// result or the callbacks instead.
  pub fn mutate(&self, variables: V, options: MutateOptions<D, V, C>) {
    let _ = self.shared.mutate(variables, options);
  }

  /// Starts a mutation and resolves to its outcome.
  pub fn mutate_async(
    &self,
    variables: V,
    options: MutateOptions<D, V, C>,
  ) -> BoxFuture<'static, Result<Arc<D>, QueryError>> {
    self.shared.mutate(variables, options).boxed()
  }

  /// Stops tracking the current mutation and goes back to idle.
  pub fn reset(&self) {
    self.shared.detach();
    {
      let mut inner = self.shared.inner.lock();
      inner.current = None;
      inner.mutate_options = None;
    }
    self.shared.update_result();
    self.shared.notify(None);
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> Drop for MutationObserver<D, V, C> {
  fn drop(&mut self) {
    self.shared.listeners.clear();
    self.shared.detach();
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> fmt::Debug for MutationObserver<D, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationObserver")
      .field("id", &self.shared.id)
      .field("result", &self.shared.inner.lock().result)
      .finish()
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> ObserverShared<D, V, C> {
  fn mutate(&self, variables: V, mutate_options: MutateOptions<D, V, C>) -> crate::mutation::MutationFuture<D> {
    self.detach();
    let options = self.inner.lock().options.clone();
    let mutation = self.client.mutation_cache().build(options, None);
    {
      let mut inner = self.inner.lock();
      inner.current = Some(mutation.clone());
      inner.mutate_options = Some(mutate_options);
    }
    let link: Weak<dyn MutationObserverLink<D, V, C>> = self.me.clone();
    mutation.add_observer(self.id, link);
    mutation.execute(variables)
  }

  /// Detaches from the tracked mutation without forgetting its last result.
  fn detach(&self) {
    let current = self.inner.lock().current.clone();
    if let Some(mutation) = current {
      mutation.remove_observer(self.id);
    }
  }

  fn update_result(&self) {
    let mut inner = self.inner.lock();
    let (state, mutation_id) = match &inner.current {
      Some(mutation) => (mutation.state(), Some(mutation.mutation_id())),
      None => (MutationState::idle(), None),
    };
    inner.result = MutationObserverResult { state, mutation_id };
  }

  fn notify(&self, action: Option<MutationActionKind>) {
    let (result, mutate_options) = {
      let inner = self.inner.lock();
      (inner.result.clone(), inner.mutate_options.clone())
    };

    notify_manager().batch(|| {
      if let (Some(callbacks), Some(action)) = (mutate_options, action) {
        run_mutate_callbacks(&callbacks, &result.state, action);
      }
      for listener in self.listeners.snapshot() {
        let result = result.clone();
        notify_manager().schedule(move || listener(&result));
      }
    });
  }
}

fn run_mutate_callbacks<D, V, C>(
  callbacks: &MutateOptions<D, V, C>,
  state: &MutationState<D, V, C>,
  action: MutationActionKind,
) {
  let Some(variables) = state.variables.as_deref() else {
    return;
  };
  let context = state.context.as_deref();
  match action {
    MutationActionKind::Success => {
      if let Some(on_success) = &callbacks.on_success {
        if let Some(data) = state.data.as_deref() {
          on_success(data, variables, context);
        }
      }
      if let Some(on_settled) = &callbacks.on_settled {
        on_settled(state.data.as_deref(), None, variables, context);
      }
    }
    MutationActionKind::Error => {
      if let Some(error) = &state.error {
        if let Some(on_error) = &callbacks.on_error {
          on_error(error, variables, context);
        }
        if let Some(on_settled) = &callbacks.on_settled {
          on_settled(None, Some(error), variables, context);
        }
      }
    }
    _ => {}
  }
}

impl<D: MutationData, V: MutationData, C: MutationData> MutationObserverLink<D, V, C> for ObserverShared<D, V, C> {
  fn on_mutation_update(&self, action: MutationActionKind) {
    self.update_result();
    self.notify(Some(action));
  }
}
