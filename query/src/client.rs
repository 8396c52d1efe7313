use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};

use crate::error::{CancelOptions, QueryError};
use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
use crate::focus_manager::focus_manager;
use crate::infinite::{InfiniteData, InfiniteQueryOptions};
use crate::key::QueryKey;
use crate::mutation::{MutationConfig, MutationData, MutationOptions};
use crate::mutation_cache::{MutationCache, MutationCacheConfig};
use crate::notify::notify_manager;
use crate::online_manager::online_manager;
use crate::options::{
  FetchOptions, InvalidateOptions, QueryConfig, QueryData, QueryObserverOptions, QueryOptions, RefetchOn,
  RefetchOptions, RefetchType, SetDataOptions,
};
use crate::query::{FetchStatus, QueryState};
use crate::query_cache::{QueryCache, QueryCacheConfig};
use crate::retryer::{NetworkMode, Retry};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::subscribable::ListenerId;

/// Client-wide defaults, layered under per-key defaults and per-call options.
#[derive(Debug, Clone, Default)]
pub struct DefaultOptions {
  pub queries: QueryConfig,
  pub mutations: MutationConfig,
}

#[derive(Default)]
struct Defaults {
  options: DefaultOptions,
  query_defaults: Vec<(QueryKey, QueryConfig)>,
  mutation_defaults: Vec<(QueryKey, MutationConfig)>,
}

struct Mounted {
  count: usize,
  focus: Option<ListenerId>,
  online: Option<ListenerId>,
}

struct ClientInner {
  query_cache: Arc<QueryCache>,
  mutation_cache: Arc<MutationCache>,
  defaults: RwLock<Defaults>,
  mounted: Mutex<Mounted>,
}

/// The entry point: owns both caches and the layered defaults.
///
/// Cloning is cheap and every clone talks to the same caches.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

/// Builds a [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
  default_options: DefaultOptions,
  query_cache_config: QueryCacheConfig,
  mutation_cache_config: MutationCacheConfig,
  query_cache: Option<Arc<QueryCache>>,
  mutation_cache: Option<Arc<MutationCache>>,
  spawner: Option<Arc<dyn TaskSpawner>>,
}

impl fmt::Debug for QueryClientBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClientBuilder")
      .field("default_options", &self.default_options)
      .field("has_query_cache", &self.query_cache.is_some())
      .field("has_mutation_cache", &self.mutation_cache.is_some())
      .field("has_spawner", &self.spawner.is_some())
      .finish_non_exhaustive()
  }
}

impl QueryClientBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn default_options(mut self, options: DefaultOptions) -> Self {
    self.default_options = options;
    self
  }

  pub fn default_query_config(mut self, config: QueryConfig) -> Self {
    self.default_options.queries = config;
    self
  }

  pub fn default_mutation_config(mut self, config: MutationConfig) -> Self {
    self.default_options.mutations = config;
    self
  }

  /// Hooks for the query cache the builder creates. Ignored when a cache is
  /// supplied with [`query_cache`](Self::query_cache).
  pub fn query_cache_config(mut self, config: QueryCacheConfig) -> Self {
    self.query_cache_config = config;
    self
  }

  pub fn mutation_cache_config(mut self, config: MutationCacheConfig) -> Self {
    self.mutation_cache_config = config;
    self
  }

  pub fn query_cache(mut self, cache: Arc<QueryCache>) -> Self {
    self.query_cache = Some(cache);
    self
  }

  pub fn mutation_cache(mut self, cache: Arc<MutationCache>) -> Self {
    self.mutation_cache = Some(cache);
    self
  }

  /// Where timers and background fetches run. Defaults to the ambient tokio
  /// runtime.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  pub fn build(self) -> QueryClient {
    let spawner = self.spawner.unwrap_or_else(|| Arc::new(TokioSpawner::new()));
    let query_cache = self
      .query_cache
      .unwrap_or_else(|| QueryCache::with_spawner(self.query_cache_config, spawner.clone()));
    let mutation_cache = self
      .mutation_cache
      .unwrap_or_else(|| MutationCache::with_spawner(self.mutation_cache_config, spawner));
    QueryClient {
      inner: Arc::new(ClientInner {
        query_cache,
        mutation_cache,
        defaults: RwLock::new(Defaults {
          options: self.default_options,
          ..Defaults::default()
        }),
        mounted: Mutex::new(Mounted {
          count: 0,
          focus: None,
          online: None,
        }),
      }),
    }
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("query_cache", &self.inner.query_cache)
      .field("mutation_cache", &self.inner.mutation_cache)
      .finish_non_exhaustive()
  }
}

impl QueryClient {
  pub fn new() -> Self {
    QueryClientBuilder::new().build()
  }

  pub fn builder() -> QueryClientBuilder {
    QueryClientBuilder::new()
  }

  pub fn query_cache(&self) -> &Arc<QueryCache> {
    &self.inner.query_cache
  }

  pub fn mutation_cache(&self) -> &Arc<MutationCache> {
    &self.inner.mutation_cache
  }

  /// Starts reacting to focus and connectivity. Calls nest: only the first
  /// `mount` subscribes and only the matching last `unmount` unsubscribes.
  pub fn mount(&self) {
    let mut mounted = self.inner.mounted.lock();
    mounted.count += 1;
    if mounted.count != 1 {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    mounted.focus = Some(focus_manager().subscribe(move || {
      if focus_manager().is_focused() {
        if let Some(inner) = Weak::upgrade(&weak) {
          inner.mutation_cache.on_focus();
          inner.query_cache.on_focus();
        }
      }
    }));

    let weak = Arc::downgrade(&self.inner);
    mounted.online = Some(online_manager().subscribe(move || {
      if online_manager().is_online() {
        if let Some(inner) = Weak::upgrade(&weak) {
          inner.mutation_cache.on_online();
          inner.query_cache.on_online();
        }
      }
    }));
    tracing::debug!("query client mounted");
  }

  pub fn unmount(&self) {
    let mut mounted = self.inner.mounted.lock();
    if mounted.count == 0 {
      return;
    }
    mounted.count -= 1;
    if mounted.count != 0 {
      return;
    }
    if let Some(id) = mounted.focus.take() {
      focus_manager().unsubscribe(id);
    }
    if let Some(id) = mounted.online.take() {
      online_manager().unsubscribe(id);
    }
    tracing::debug!("query client unmounted");
  }

  /// How many matching queries are fetching right now.
  pub fn is_fetching(&self, filters: impl Into<QueryFilters>) -> usize {
    let filters = filters.into().fetch_status(FetchStatus::Fetching);
    self.query_cache().find_all(filters).len()
  }

  /// How many matching mutations are pending right now.
  pub fn is_mutating(&self, filters: impl Into<MutationFilters>) -> usize {
    let filters = filters.into().fetching(true);
    self.mutation_cache().find_all(filters).len()
  }

  pub fn get_query_data<T: QueryData>(&self, query_key: impl Into<QueryKey>) -> Option<Arc<T>> {
    let query_key = query_key.into();
    self
      .query_cache()
      .get_typed::<T>(&query_key.hash_key())
      .and_then(|query| query.data())
  }

  pub fn get_query_state<T: QueryData>(&self, query_key: impl Into<QueryKey>) -> Option<QueryState<T>> {
    let query_key = query_key.into();
    self
      .query_cache()
      .get_typed::<T>(&query_key.hash_key())
      .map(|query| query.state())
  }

  /// Data of every matching query holding a `T`, in cache order.
  pub fn get_queries_data<T: QueryData>(&self, filters: impl Into<QueryFilters>) -> Vec<(QueryKey, Option<Arc<T>>)> {
    self
      .query_cache()
      .find_all(filters)
      .into_iter()
      .filter_map(|query| {
        let typed = self.query_cache().get_typed::<T>(query.query_hash())?;
        Some((typed.query_key().clone(), typed.data()))
      })
      .collect()
  }

  /// Cached data when there is any, otherwise the result of
  /// [`fetch_query`](Self::fetch_query).
  pub fn ensure_query_data<T: QueryData>(&self, options: QueryOptions<T>) -> BoxFuture<'static, Result<Arc<T>, QueryError>> {
    match self.get_query_data::<T>(options.query_key()) {
      Some(data) => future::ready(Ok(data)).boxed(),
      None => self.fetch_query(options),
    }
  }

  /// Writes `data` into the query for `query_key`, creating the query if
  /// needed. The write counts as a successful fetch at the current time.
  pub fn set_query_data<T: QueryData>(&self, query_key: impl Into<QueryKey>, data: T) -> Result<Arc<T>, QueryError> {
    let written = self.set_query_data_with(query_key, move |_: Option<&T>| Some(data), SetDataOptions::default())?;
    written.ok_or_else(|| QueryError::fetch("updater produced no data"))
  }

  /// Derives the new data from the current one. Returning `None` leaves the
  /// cache untouched.
  pub fn set_query_data_with<T: QueryData>(
    &self,
    query_key: impl Into<QueryKey>,
    updater: impl FnOnce(Option<&T>) -> Option<T>,
    options: SetDataOptions,
  ) -> Result<Option<Arc<T>>, QueryError> {
    let query_key = query_key.into();
    let previous = self.get_query_data::<T>(&query_key);
    let Some(data) = updater(previous.as_deref()) else {
      return Ok(None);
    };
    let defaulted = self.default_query_options(QueryOptions::<T>::new(query_key));
    let query = self.query_cache().build(&defaulted, None)?;
    let options = SetDataOptions {
      manual: true,
      ..options
    };
    Ok(Some(query.set_data(data, options)))
  }

  /// Applies `updater` to every matching query holding a `T`.
  pub fn set_queries_data<T: QueryData>(
    &self,
    filters: impl Into<QueryFilters>,
    updater: impl Fn(Option<&T>) -> Option<T>,
  ) -> Vec<(QueryKey, Option<Arc<T>>)> {
    let matches = self.query_cache().find_all(filters);
    notify_manager().batch(|| {
      matches
        .into_iter()
        .filter_map(|query| self.query_cache().get_typed::<T>(query.query_hash()))
        .map(|query| {
          let key = query.query_key().clone();
          let written = self
            .set_query_data_with(key.clone(), &updater, SetDataOptions::default())
            .ok()
            .flatten();
          (key, written)
        })
        .collect()
    })
  }

  /// Removes matching queries from the cache.
  pub fn remove_queries(&self, filters: impl Into<QueryFilters>) {
    let cache = self.query_cache();
    notify_manager().batch(|| {
      for query in cache.find_all(filters) {
        cache.remove(&query);
      }
    });
  }

  /// Resets matching queries to their initial state, then refetches the
  /// active ones.
  pub fn reset_queries(
    &self,
    filters: impl Into<QueryFilters>,
    options: RefetchOptions,
  ) -> BoxFuture<'static, Result<(), QueryError>> {
    let filters = filters.into();
    let mut refetch_filters = filters.clone();
    if refetch_filters.query_type == QueryTypeFilter::All {
      refetch_filters.query_type = QueryTypeFilter::Active;
    }
    notify_manager().batch(|| {
      for query in self.query_cache().find_all(filters) {
        query.reset();
      }
      self.refetch_queries(refetch_filters, options)
    })
  }

  /// Cancels matching fetches and reverts them to their pre-fetch state.
  pub fn cancel_queries(&self, filters: impl Into<QueryFilters>) -> BoxFuture<'static, ()> {
    self.cancel_queries_with(filters, CancelOptions::revert())
  }

  pub fn cancel_queries_with(
    &self,
    filters: impl Into<QueryFilters>,
    options: CancelOptions,
  ) -> BoxFuture<'static, ()> {
    let cancels: Vec<_> = notify_manager().batch(|| {
      self
        .query_cache()
        .find_all(filters)
        .into_iter()
        .map(|query| query.cancel(options))
        .collect()
    });
    future::join_all(cancels).map(|_| ()).boxed()
  }

  /// Marks matching queries invalid and refetches them according to
  /// `options.refetch_type`.
  pub fn invalidate_queries(
    &self,
    filters: impl Into<QueryFilters>,
    options: InvalidateOptions,
  ) -> BoxFuture<'static, Result<(), QueryError>> {
    let filters = filters.into();
    notify_manager().batch(|| {
      for query in self.query_cache().find_all(filters.clone()) {
        query.invalidate();
      }
      let query_type = match options.refetch_type {
        RefetchType::None => return future::ready(Ok(())).boxed(),
        RefetchType::Active => QueryTypeFilter::Active,
        RefetchType::Inactive => QueryTypeFilter::Inactive,
        RefetchType::All => QueryTypeFilter::All,
      };
      let refetch_filters = filters.query_type(query_type);
      self.refetch_queries(
        refetch_filters,
        RefetchOptions {
          cancel_refetch: options.cancel_refetch,
          throw_on_error: options.throw_on_error,
        },
      )
    })
  }

  /// Refetches every matching query that is not disabled. Fetches start
  /// before this returns; the future resolves once all of them settled.
  /// Paused fetches count as settled.
  pub fn refetch_queries(
    &self,
    filters: impl Into<QueryFilters>,
    options: RefetchOptions,
  ) -> BoxFuture<'static, Result<(), QueryError>> {
    let fetch_options = FetchOptions::from(options);
    let refetches: Vec<_> = notify_manager().batch(|| {
      self
        .query_cache()
        .find_all(filters)
        .into_iter()
        .filter(|query| !query.is_disabled())
        .map(|query| query.refetch(fetch_options.clone()))
        .collect()
    });
    let throw_on_error = options.throw_on_error;
    async move {
      let results = future::join_all(refetches).await;
      if throw_on_error {
        results.into_iter().collect::<Result<Vec<()>, QueryError>>()?;
      }
      Ok(())
    }
    .boxed()
  }

  /// Fetches the query unless its cached data is still fresh. Retries are
  /// off unless the options or defaults enable them.
  pub fn fetch_query<T: QueryData>(&self, options: QueryOptions<T>) -> BoxFuture<'static, Result<Arc<T>, QueryError>> {
    let mut defaulted = self.default_query_options(options);
    if defaulted.config.retry.is_none() {
      defaulted.config.retry = Some(Retry::Never);
    }
    let query = match self.query_cache().build(&defaulted, None) {
      Ok(query) => query,
      Err(error) => return future::ready(Err(error)).boxed(),
    };
    let stale = query.is_stale_by_time(defaulted.config.resolved_stale_time());
    match query.data() {
      Some(data) if !stale => future::ready(Ok(data)).boxed(),
      _ => query.fetch(Some(defaulted), FetchOptions::default()).boxed(),
    }
  }

  /// Like [`fetch_query`](Self::fetch_query) but discards the outcome.
  pub fn prefetch_query<T: QueryData>(&self, options: QueryOptions<T>) -> BoxFuture<'static, ()> {
    self.fetch_query(options).map(|_| ()).boxed()
  }

  pub fn fetch_infinite_query<P, TP>(
    &self,
    options: InfiniteQueryOptions<P, TP>,
  ) -> BoxFuture<'static, Result<Arc<InfiniteData<P, TP>>, QueryError>>
  where
    P: QueryData + Clone,
    TP: QueryData + Clone,
  {
    self.fetch_query(options.into_query_options())
  }

  pub fn prefetch_infinite_query<P, TP>(&self, options: InfiniteQueryOptions<P, TP>) -> BoxFuture<'static, ()>
  where
    P: QueryData + Clone,
    TP: QueryData + Clone,
  {
    self.fetch_infinite_query(options).map(|_| ()).boxed()
  }

  /// Continues paused mutations one after the other.
  pub async fn resume_paused_mutations(&self) {
    self.mutation_cache().resume_paused_mutations().await;
  }

  pub fn default_options(&self) -> DefaultOptions {
    self.inner.defaults.read().options.clone()
  }

  pub fn set_default_options(&self, options: DefaultOptions) {
    self.inner.defaults.write().options = options;
  }

  /// Registers defaults for every query whose key starts with `query_key`.
  /// Setting the same key again replaces its entry in place.
  pub fn set_query_defaults(&self, query_key: impl Into<QueryKey>, config: QueryConfig) {
    let query_key = query_key.into();
    let hash = query_key.hash_key();
    let mut defaults = self.inner.defaults.write();
    match defaults
      .query_defaults
      .iter_mut()
      .find(|(key, _)| key.hash_key() == hash)
    {
      Some(entry) => entry.1 = config,
      None => defaults.query_defaults.push((query_key, config)),
    }
  }

  /// The first registered defaults whose key is a prefix of `query_key`.
  pub fn get_query_defaults(&self, query_key: &QueryKey) -> Option<QueryConfig> {
    self
      .inner
      .defaults
      .read()
      .query_defaults
      .iter()
      .find(|(key, _)| query_key.partial_matches(key))
      .map(|(_, config)| config.clone())
  }

  pub fn set_mutation_defaults(&self, mutation_key: impl Into<QueryKey>, config: MutationConfig) {
    let mutation_key = mutation_key.into();
    let hash = mutation_key.hash_key();
    let mut defaults = self.inner.defaults.write();
    match defaults
      .mutation_defaults
      .iter_mut()
      .find(|(key, _)| key.hash_key() == hash)
    {
      Some(entry) => entry.1 = config,
      None => defaults.mutation_defaults.push((mutation_key, config)),
    }
  }

  pub fn get_mutation_defaults(&self, mutation_key: &QueryKey) -> Option<MutationConfig> {
    self
      .inner
      .defaults
      .read()
      .mutation_defaults
      .iter()
      .find(|(key, _)| mutation_key.partial_matches(key))
      .map(|(_, config)| config.clone())
  }

  /// Layers the client defaults, then the first matching per-key defaults,
  /// under `options`. Applying it twice gives the same result.
  pub fn default_query_options<T: QueryData>(&self, mut options: QueryOptions<T>) -> QueryOptions<T> {
    let global = self.inner.defaults.read().options.queries.clone();
    let layered = match self.get_query_defaults(&options.query_key) {
      Some(per_key) => global.merge(&per_key),
      None => global,
    };
    options.config = layered.merge(&options.config);
    if options.config.refetch_on_reconnect.is_none() && options.config.network_mode == Some(NetworkMode::Always) {
      options.config.refetch_on_reconnect = Some(RefetchOn::Never);
    }
    if options.query_hash.is_none() {
      options.query_hash = Some(options.query_key.hash_key());
    }
    options
  }

  pub fn default_observer_options<T: QueryData, S: QueryData>(
    &self,
    options: QueryObserverOptions<T, S>,
  ) -> QueryObserverOptions<T, S> {
    options.map_query(|query| self.default_query_options(query))
  }

  pub fn default_mutation_options<D, V, C>(&self, mut options: MutationOptions<D, V, C>) -> MutationOptions<D, V, C>
  where
    D: MutationData,
    V: MutationData,
    C: MutationData,
  {
    let global = self.inner.defaults.read().options.mutations.clone();
    let per_key = options
      .mutation_key
      .as_ref()
      .and_then(|key| self.get_mutation_defaults(key));
    let layered = match per_key {
      Some(per_key) => global.merge(&per_key),
      None => global,
    };
    options.config = layered.merge(&options.config);
    options
  }

  /// Empties both caches.
  pub fn clear(&self) {
    self.query_cache().clear();
    self.mutation_cache().clear();
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[test]
  fn first_matching_query_defaults_win() {
    let client = QueryClient::new();
    client.set_query_defaults(
      "todos",
      QueryConfig {
        stale_time: Some(Duration::from_secs(1)),
        ..QueryConfig::default()
      },
    );
    client.set_query_defaults(
      QueryKey::from("todos").with(1),
      QueryConfig {
        stale_time: Some(Duration::from_secs(2)),
        ..QueryConfig::default()
      },
    );

    let found = client.get_query_defaults(&QueryKey::from("todos").with(1));
    assert_eq!(found.and_then(|config| config.stale_time), Some(Duration::from_secs(1)));
    assert!(client.get_query_defaults(&QueryKey::from("users")).is_none());
  }

  #[test]
  fn defaulting_is_idempotent() {
    let client = QueryClient::builder()
      .default_query_config(QueryConfig {
        retry: Some(Retry::Count(1)),
        network_mode: Some(NetworkMode::Always),
        ..QueryConfig::default()
      })
      .build();
    let once = client.default_query_options(QueryOptions::<u32>::new("n").stale_time(Duration::from_secs(5)));
    let twice = client.default_query_options(once.clone());

    assert_eq!(once.config.stale_time, Some(Duration::from_secs(5)));
    assert_eq!(once.config.refetch_on_reconnect, Some(RefetchOn::Never));
    assert_eq!(twice.config.stale_time, once.config.stale_time);
    assert_eq!(twice.config.refetch_on_reconnect, once.config.refetch_on_reconnect);
    assert_eq!(twice.query_hash(), once.query_hash());
  }

  #[test]
  fn mutation_defaults_layer_under_options() {
    let client = QueryClient::new();
    client.set_mutation_defaults(
      "save",
      MutationConfig {
        retry: Some(Retry::Count(3)),
        cache_time: Some(Duration::from_secs(9)),
        ..MutationConfig::default()
      },
    );
    let options = client
      .default_mutation_options(MutationOptions::<u32, u32>::new().mutation_key("save").retry(Retry::Never));
    assert_eq!(options.config.cache_time, Some(Duration::from_secs(9)));
    assert!(matches!(options.config.retry, Some(Retry::Never)));
  }
}
