use std::fmt;
use std::sync::{Arc, Weak};

use ahash::HashMap;
use parking_lot::RwLock;

use crate::error::QueryError;
use crate::filters::QueryFilters;
use crate::notify::notify_manager;
use crate::options::{QueryData, QueryOptions};
use crate::query::{ActionKind, CachedQuery, Query, QueryState};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::subscribable::{ListenerId, Subscribable};

/// Something that happened to a query in the cache.
#[derive(Clone)]
pub enum QueryCacheEvent {
  Added(Arc<dyn CachedQuery>),
  Removed(Arc<dyn CachedQuery>),
  Updated {
    query: Arc<dyn CachedQuery>,
    action: ActionKind,
  },
  ObserverAdded(Arc<dyn CachedQuery>),
  ObserverRemoved(Arc<dyn CachedQuery>),
  ObserverResultsUpdated(Arc<dyn CachedQuery>),
  ObserverOptionsUpdated(Arc<dyn CachedQuery>),
}

impl QueryCacheEvent {
  pub fn query(&self) -> &Arc<dyn CachedQuery> {
    match self {
      QueryCacheEvent::Added(query)
      | QueryCacheEvent::Removed(query)
      | QueryCacheEvent::Updated { query, .. }
      | QueryCacheEvent::ObserverAdded(query)
      | QueryCacheEvent::ObserverRemoved(query)
      | QueryCacheEvent::ObserverResultsUpdated(query)
      | QueryCacheEvent::ObserverOptionsUpdated(query) => query,
    }
  }
}

impl fmt::Debug for QueryCacheEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self {
      QueryCacheEvent::Added(_) => "Added",
      QueryCacheEvent::Removed(_) => "Removed",
      QueryCacheEvent::Updated { .. } => "Updated",
      QueryCacheEvent::ObserverAdded(_) => "ObserverAdded",
      QueryCacheEvent::ObserverRemoved(_) => "ObserverRemoved",
      QueryCacheEvent::ObserverResultsUpdated(_) => "ObserverResultsUpdated",
      QueryCacheEvent::ObserverOptionsUpdated(_) => "ObserverOptionsUpdated",
    };
    let mut debug = f.debug_struct(kind);
    debug.field("query_hash", &self.query().query_hash());
    if let QueryCacheEvent::Updated { action, .. } = self {
      debug.field("action", action);
    }
    debug.finish()
  }
}

type EventListener = dyn Fn(&QueryCacheEvent) + Send + Sync;

/// Cache-wide hooks, called for every query after its own handling.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
  pub on_error: Option<Arc<dyn Fn(&QueryError, &dyn CachedQuery) + Send + Sync>>,
  pub on_success: Option<Arc<dyn Fn(&dyn CachedQuery) + Send + Sync>>,
  pub on_settled: Option<Arc<dyn Fn(Option<&QueryError>, &dyn CachedQuery) + Send + Sync>>,
}

impl fmt::Debug for QueryCacheConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCacheConfig")
      .field("on_error", &self.on_error.is_some())
      .field("on_success", &self.on_success.is_some())
      .field("on_settled", &self.on_settled.is_some())
      .finish()
  }
}

#[derive(Default)]
struct Registry {
  by_hash: HashMap<String, Arc<dyn CachedQuery>>,
  order: Vec<Arc<dyn CachedQuery>>,
}

/// The registry of all queries, keyed by the hash of their key.
pub struct QueryCache {
  me: Weak<QueryCache>,
  config: QueryCacheConfig,
  spawner: Arc<dyn TaskSpawner>,
  registry: RwLock<Registry>,
  listeners: Subscribable<EventListener>,
}

impl QueryCache {
  pub fn new(config: QueryCacheConfig) -> Arc<Self> {
    Self::with_spawner(config, Arc::new(TokioSpawner::new()))
  }

  pub fn with_spawner(config: QueryCacheConfig, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
    Arc::new_cyclic(|me| QueryCache {
      me: me.clone(),
      config,
      spawner,
      registry: RwLock::new(Registry::default()),
      listeners: Subscribable::new(),
    })
  }

  pub fn config(&self) -> &QueryCacheConfig {
    &self.config
  }

  /// Returns the query for the options' hash, creating it when missing.
  ///
  /// The options of an existing query are left untouched.
  pub fn build<T: QueryData>(
    &self,
    options: &QueryOptions<T>,
    state: Option<QueryState<T>>,
  ) -> Result<Arc<Query<T>>, QueryError> {
    let query_hash = options.query_hash();
    if let Some(existing) = self.get(&query_hash) {
      return downcast(existing, &query_hash);
    }

    let created = {
      let mut registry = self.registry.write();
      if let Some(existing) = registry.by_hash.get(&query_hash).cloned() {
        drop(registry);
        return downcast(existing, &query_hash);
      }
      let query = Query::new(self.me.clone(), self.spawner.clone(), options.clone(), state);
      let erased: Arc<dyn CachedQuery> = query.clone();
      registry.by_hash.insert(query_hash.clone(), erased.clone());
      registry.order.push(erased.clone());
      (query, erased)
    };

    tracing::trace!(query_hash = %query_hash, "query added");
    self.notify(QueryCacheEvent::Added(created.1));
    Ok(created.0)
  }

  /// Registers a query built elsewhere. Ignored when the hash is taken.
  pub fn add(&self, query: Arc<dyn CachedQuery>) {
    let added = {
      let mut registry = self.registry.write();
      let hash = query.query_hash().to_string();
      if registry.by_hash.contains_key(&hash) {
        false
      } else {
        registry.by_hash.insert(hash, query.clone());
        registry.order.push(query.clone());
        true
      }
    };
    if added {
      self.notify(QueryCacheEvent::Added(query));
    }
  }

  /// Removes and destroys `query`. Removing twice is a no-op.
  pub fn remove(&self, query: &Arc<dyn CachedQuery>) {
    let removed = {
      let mut registry = self.registry.write();
      let hash = query.query_hash();
      match registry.by_hash.get(hash) {
        Some(current) if Arc::ptr_eq(current, query) => {
          registry.by_hash.remove(hash);
          registry.order.retain(|entry| !Arc::ptr_eq(entry, query));
          true
        }
        _ => false,
      }
    };
    if removed {
      query.destroy();
      self.notify(QueryCacheEvent::Removed(query.clone()));
    }
  }

  pub fn clear(&self) {
    notify_manager().batch(|| {
      for query in self.get_all() {
        self.remove(&query);
      }
    });
  }

  pub fn get(&self, query_hash: &str) -> Option<Arc<dyn CachedQuery>> {
    self.registry.read().by_hash.get(query_hash).cloned()
  }

  /// The typed query for `query_hash`, if registered with data type `T`.
  pub fn get_typed<T: QueryData>(&self, query_hash: &str) -> Option<Arc<Query<T>>> {
    self.get(query_hash).and_then(|query| query.as_any().downcast::<Query<T>>().ok())
  }

  /// All queries in insertion order.
  pub fn get_all(&self) -> Vec<Arc<dyn CachedQuery>> {
    self.registry.read().order.clone()
  }

  pub fn len(&self) -> usize {
    self.registry.read().order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The first query matching `filters`. Keys match exactly unless the
  /// filters say otherwise.
  pub fn find(&self, filters: impl Into<QueryFilters>) -> Option<Arc<dyn CachedQuery>> {
    let filters = filters.into();
    self
      .get_all()
      .into_iter()
      .find(|query| filters.matches_with_default(query.as_ref(), true))
  }

  /// Every query matching `filters`. Keys match by prefix unless `exact`.
  pub fn find_all(&self, filters: impl Into<QueryFilters>) -> Vec<Arc<dyn CachedQuery>> {
    let filters = filters.into();
    self
      .get_all()
      .into_iter()
      .filter(|query| filters.matches_with_default(query.as_ref(), false))
      .collect()
  }

  pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static) -> ListenerId {
    self.listeners.subscribe(Arc::new(listener))
  }

  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    self.listeners.unsubscribe(id)
  }

  /// Delivers `event` to every listener through the notify manager.
  pub fn notify(&self, event: QueryCacheEvent) {
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

  pub fn on_focus(&self) {
    notify_manager().batch(|| {
      for query in self.get_all() {
        query.on_focus();
      }
    });
  }

  pub fn on_online(&self) {
    notify_manager().batch(|| {
      for query in self.get_all() {
        query.on_online();
      }
    });
  }

  pub(crate) fn on_query_success(&self, query: Arc<dyn CachedQuery>) {
    if let Some(on_success) = &self.config.on_success {
      on_success(query.as_ref());
    }
    if let Some(on_settled) = &self.config.on_settled {
      on_settled(None, query.as_ref());
    }
  }

  pub(crate) fn on_query_error(&self, error: &QueryError, query: Arc<dyn CachedQuery>) {
    if let Some(on_error) = &self.config.on_error {
      on_error(error, query.as_ref());
    }
    if let Some(on_settled) = &self.config.on_settled {
      on_settled(Some(error), query.as_ref());
    }
  }

  pub(crate) fn spawner(&self) -> &Arc<dyn TaskSpawner> {
    &self.spawner
  }
}

fn downcast<T: QueryData>(query: Arc<dyn CachedQuery>, query_hash: &str) -> Result<Arc<Query<T>>, QueryError> {
  query
    .as_any()
    .downcast::<Query<T>>()
    .map_err(|_| QueryError::TypeMismatch(query_hash.to_string()))
}

impl fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCache")
      .field("queries", &self.len())
      .field("listeners", &self.listeners.listener_count())
      .finish_non_exhaustive()
  }
}
