use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::QueryError;
use crate::filters::MutationFilters;
use crate::mutation::{CachedMutation, Mutation, MutationActionKind, MutationData, MutationOptions, MutationState};
use crate::notify::notify_manager;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::subscribable::{ListenerId, Subscribable};

/// Something that happened to a mutation in the cache.
#[derive(Clone)]
pub enum MutationCacheEvent {
  Added(Arc<dyn CachedMutation>),
  Removed(Arc<dyn CachedMutation>),
  Updated {
    mutation: Arc<dyn CachedMutation>,
    action: MutationActionKind,
  },
  ObserverAdded(Arc<dyn CachedMutation>),
  ObserverRemoved(Arc<dyn CachedMutation>),
  ObserverOptionsUpdated(Arc<dyn CachedMutation>),
}

impl MutationCacheEvent {
  pub fn mutation(&self) -> &Arc<dyn CachedMutation> {
    match self {
      MutationCacheEvent::Added(mutation)
      | MutationCacheEvent::Removed(mutation)
      | MutationCacheEvent::Updated { mutation, .. }
      | MutationCacheEvent::ObserverAdded(mutation)
      | MutationCacheEvent::ObserverRemoved(mutation)
      | MutationCacheEvent::ObserverOptionsUpdated(mutation) => mutation,
    }
  }
}

impl fmt::Debug for MutationCacheEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self {
      MutationCacheEvent::Added(_) => "Added",
      MutationCacheEvent::Removed(_) => "Removed",
      MutationCacheEvent::Updated { .. } => "Updated",
      MutationCacheEvent::ObserverAdded(_) => "ObserverAdded",
      MutationCacheEvent::ObserverRemoved(_) => "ObserverRemoved",
      MutationCacheEvent::ObserverOptionsUpdated(_) => "ObserverOptionsUpdated",
    };
    let mut debug = f.debug_struct(kind);
    debug.field("mutation_id", &self.mutation().mutation_id());
    if let MutationCacheEvent::Updated { action, .. } = self {
      debug.field("action", action);
    }
    debug.finish()
  }
}

type EventListener = dyn Fn(&MutationCacheEvent) + Send + Sync;

/// Cache-wide hooks, called before the mutation's own callbacks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
  pub on_mutate: Option<Arc<dyn Fn(&dyn CachedMutation) + Send + Sync>>,
  pub on_success: Option<Arc<dyn Fn(&dyn CachedMutation) + Send + Sync>>,
  pub on_error: Option<Arc<dyn Fn(&QueryError, &dyn CachedMutation) + Send + Sync>>,
  pub on_settled: Option<Arc<dyn Fn(Option<&QueryError>, &dyn CachedMutation) + Send + Sync>>,
}

impl fmt::Debug for MutationCacheConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCacheConfig")
      .field("on_mutate", &self.on_mutate.is_some())
      .field("on_success", &self.on_success.is_some())
      .field("on_error", &self.on_error.is_some())
      .field("on_settled", &self.on_settled.is_some())
      .finish()
  }
}

/// Every mutation the client knows about, in submission order.
pub struct MutationCache {
  me: Weak<MutationCache>,
  config: MutationCacheConfig,
  spawner: Arc<dyn TaskSpawner>,
  next_id: AtomicU64,
  mutations: RwLock<Vec<Arc<dyn CachedMutation>>>,
  listeners: Subscribable<EventListener>,
  resuming: tokio::sync::Mutex<()>,
}

impl MutationCache {
  pub fn new(config: MutationCacheConfig) -> Arc<Self> {
    Self::with_spawner(config, Arc::new(TokioSpawner::new()))
  }

  pub fn with_spawner(config: MutationCacheConfig, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
    Arc::new_cyclic(|me| MutationCache {
      me: me.clone(),
      config,
      spawner,
      next_id: AtomicU64::new(1),
      mutations: RwLock::new(Vec::new()),
      listeners: Subscribable::new(),
      resuming: tokio::sync::Mutex::new(()),
    })
  }

  pub fn config(&self) -> &MutationCacheConfig {
    &self.config
  }

  /// Creates and registers a new mutation. Mutations are never shared.
  pub fn build<D, V, C>(
    &self,
    options: MutationOptions<D, V, C>,
    state: Option<MutationState<D, V, C>>,
  ) -> Arc<Mutation<D, V, C>>
  where
    D: MutationData,
    V: MutationData,
    C: MutationData,
  {
    let mutation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mutation = Mutation::new(self.me.clone(), self.spawner.clone(), mutation_id, options, state);
    self.add(mutation.clone());
    mutation
  }

  pub fn add(&self, mutation: Arc<dyn CachedMutation>) {
    self.mutations.write().push(mutation.clone());
    self.notify(MutationCacheEvent::Added(mutation));
  }

  /// Removes and destroys `mutation`. Removing twice is a no-op.
  pub fn remove(&self, mutation: &Arc<dyn CachedMutation>) {
    let removed = {
      let mut mutations = self.mutations.write();
      let before = mutations.len();
      mutations.retain(|entry| !Arc::ptr_eq(entry, mutation));
      mutations.len() != before
    };
    if removed {
      mutation.destroy();
      self.notify(MutationCacheEvent::Removed(mutation.clone()));
    }
  }

  pub fn clear(&self) {
    notify_manager().batch(|| {
      for mutation in self.get_all() {
        self.remove(&mutation);
      }
    });
  }

  pub fn get_all(&self) -> Vec<Arc<dyn CachedMutation>> {
    self.mutations.read().clone()
  }

  pub fn len(&self) -> usize {
    self.mutations.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The first match. Keys match exactly unless the filters say otherwise.
  pub fn find(&self, filters: impl Into<MutationFilters>) -> Option<Arc<dyn CachedMutation>> {
    let filters = filters.into();
    self
      .get_all()
      .into_iter()
      .find(|mutation| filters.matches_with_default(mutation.as_ref(), true))
  }

  pub fn find_all(&self, filters: impl Into<MutationFilters>) -> Vec<Arc<dyn CachedMutation>> {
    let filters = filters.into();
    self
      .get_all()
      .into_iter()
      .filter(|mutation| filters.matches_with_default(mutation.as_ref(), false))
      .collect()
  }

  pub fn subscribe(&self, listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static) -> ListenerId {
    self.listeners.subscribe(Arc::new(listener))
  }

  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    self.listeners.unsubscribe(id)
  }

  pub fn notify(&self, event: MutationCacheEvent) {
    let listeners = self.listeners.snapshot();
    if listeners.is_empty() {
      return;
    }
    notify_manager().batch(|| {
      for listener in listeners {
        let event = event.clone();
        notify_manager().schedule(move || listener(&event));
      }
    });
  }

  /// Continues every paused mutation, one after the other in submission
  /// order. Failures are ignored so one mutation cannot block the rest.
  /// Concurrent calls run one at a time.
  pub async fn resume_paused_mutations(&self) {
    let _resuming = self.resuming.lock().await;
    let paused: Vec<_> = self
      .get_all()
      .into_iter()
      .filter(|mutation| mutation.is_paused())
      .collect();
    if !paused.is_empty() {
      tracing::debug!(count = paused.len(), "resuming paused mutations");
    }
    for mutation in paused {
      if let Err(error) = mutation.continue_execution().await {
        tracing::debug!(mutation_id = mutation.mutation_id(), error = %error, "resumed mutation failed");
      }
    }
  }

  /// Resumes paused mutations in the background.
  pub fn on_focus(&self) {
    self.resume_in_background();
  }

  pub fn on_online(&self) {
    self.resume_in_background();
  }

  fn resume_in_background(&self) {
    if let Some(cache) = self.me.upgrade() {
      self.spawner.spawn(Box::pin(async move {
        cache.resume_paused_mutations().await;
      }));
    }
  }

  pub(crate) fn on_mutation_start(&self, mutation: &dyn CachedMutation) {
    if let Some(on_mutate) = &self.config.on_mutate {
      on_mutate(mutation);
    }
  }

  pub(crate) fn on_mutation_success(&self, mutation: &dyn CachedMutation) {
    if let Some(on_success) = &self.config.on_success {
      on_success(mutation);
    }
  }

  pub(crate) fn on_mutation_error(&self, error: &QueryError, mutation: &dyn CachedMutation) {
    if let Some(on_error) = &self.config.on_error {
      on_error(error, mutation);
    }
  }

  pub(crate) fn on_mutation_settled(&self, error: Option<&QueryError>, mutation: &dyn CachedMutation) {
    if let Some(on_settled) = &self.config.on_settled {
      on_settled(error, mutation);
    }
  }
}

impl fmt::Debug for MutationCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCache")
      .field("mutations", &self.len())
      .field("listeners", &self.listeners.listener_count())
      .finish_non_exhaustive()
  }
}
