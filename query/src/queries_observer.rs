use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::notify::notify_manager;
use crate::observer::{QueryObserver, QueryObserverResult};
use crate::options::{QueryData, QueryObserverOptions};
use crate::subscribable::{ListenerId, Subscribable};

type ResultsListener<T> = dyn Fn(&[QueryObserverResult<T>]) + Send + Sync;

struct QueriesInner<T: QueryData> {
  observers: Vec<Arc<QueryObserver<T>>>,
  result: Vec<QueryObserverResult<T>>,
}

struct QueriesShared<T: QueryData> {
  me: Weak<QueriesShared<T>>,
  client: QueryClient,
  listeners: Subscribable<ResultsListener<T>>,
  inner: Mutex<QueriesInner<T>>,
}

/// Observes a dynamic list of queries and reports their results in list order.
///
/// Replacing the list keeps the observer of every query whose hash is still
/// present, wherever it moved to.
pub struct QueriesObserver<T: QueryData> {
  shared: Arc<QueriesShared<T>>,
}

impl<T: QueryData> QueriesObserver<T> {
  pub fn new<O>(client: &QueryClient, queries: impl IntoIterator<Item = O>) -> Result<Self, QueryError>
  where
    O: Into<QueryObserverOptions<T>>,
  {
    let shared = Arc::new_cyclic(|me| QueriesShared {
      me: me.clone(),
      client: client.clone(),
      listeners: Subscribable::new(),
      inner: Mutex::new(QueriesInner {
        observers: Vec::new(),
        result: Vec::new(),
      }),
    });
    shared.set_queries(queries.into_iter().map(Into::into).collect())?;
    Ok(Self { shared })
  }

  pub fn subscribe(&self, listener: impl Fn(&[QueryObserverResult<T>]) + Send + Sync + 'static) -> ListenerId {
    let id = self.shared.listeners.subscribe(Arc::new(listener));
    if self.shared.listeners.listener_count() == 1 {
      let observers = self.shared.inner.lock().observers.clone();
      for observer in &observers {
        self.shared.subscribe_child(observer);
      }
    }
    id
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.shared.listeners.unsubscribe(id);
    if !self.shared.listeners.has_listeners() {
      self.shared.destroy();
    }
  }

  pub fn has_listeners(&self) -> bool {
    self.shared.listeners.has_listeners()
  }

  pub fn destroy(&self) {
    self.shared.destroy();
  }

  /// Replaces the observed list.
  pub fn set_queries<O>(&self, queries: impl IntoIterator<Item = O>) -> Result<(), QueryError>
  where
    O: Into<QueryObserverOptions<T>>,
  {
    self.shared.set_queries(queries.into_iter().map(Into::into).collect())
  }

  pub fn current_result(&self) -> Vec<QueryObserverResult<T>> {
    self.shared.inner.lock().result.clone()
  }

  pub fn observers(&self) -> Vec<Arc<QueryObserver<T>>> {
    self.shared.inner.lock().observers.clone()
  }

  /// The results the given list would produce right now, without switching
  /// to it.
  pub fn get_optimistic_result<O>(
    &self,
    queries: impl IntoIterator<Item = O>,
  ) -> Result<Vec<QueryObserverResult<T>>, QueryError>
  where
    O: Into<QueryObserverOptions<T>>,
  {
    let prev = self.shared.inner.lock().observers.clone();
    let queries = queries.into_iter().map(Into::into).collect();
    self
      .shared
      .find_matching_observers(&prev, queries)?
      .into_iter()
      .map(|(options, observer)| observer.get_optimistic_result(options))
      .collect()
  }
}

impl<T: QueryData> Drop for QueriesObserver<T> {
  fn drop(&mut self) {
    self.shared.destroy();
  }
}

impl<T: QueryData> fmt::Debug for QueriesObserver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueriesObserver")
      .field("observers", &self.shared.inner.lock().observers.len())
      .field("listeners", &self.shared.listeners.listener_count())
      .finish()
  }
}

type Matched<T> = (QueryObserverOptions<T>, Arc<QueryObserver<T>>);

fn contains<T: QueryData>(list: &[Arc<QueryObserver<T>>], observer: &Arc<QueryObserver<T>>) -> bool {
  list.iter().any(|entry| Arc::ptr_eq(entry, observer))
}

impl<T: QueryData> QueriesShared<T> {
  fn set_queries(&self, queries: Vec<QueryObserverOptions<T>>) -> Result<(), QueryError> {
    notify_manager().batch(|| {
      let prev = self.inner.lock().observers.clone();
      let matches = self.find_matching_observers(&prev, queries)?;
      for (options, observer) in &matches {
        observer.set_options(options.clone())?;
      }

      let next: Vec<_> = matches.into_iter().map(|(_, observer)| observer).collect();
      let unchanged = prev.len() == next.len() && prev.iter().zip(&next).all(|(a, b)| Arc::ptr_eq(a, b));
      if unchanged {
        return Ok(());
      }

      {
        let mut inner = self.inner.lock();
        inner.result = next.iter().map(|observer| observer.current_result()).collect();
        inner.observers = next.clone();
      }

      if !self.listeners.has_listeners() {
        return Ok(());
      }
      for observer in prev.iter().filter(|observer| !contains(&next, observer)) {
        observer.destroy();
      }
      for observer in next.iter().filter(|observer| !contains(&prev, observer)) {
        self.subscribe_child(observer);
      }
      self.notify();
      Ok(())
    })
  }

  /// Pairs every requested query with an observer: the previous observer for
  /// the same hash, an unmatched previous observer at the same position when
  /// the query keeps previous data, or a new one.
  fn find_matching_observers(
    &self,
    prev: &[Arc<QueryObserver<T>>],
    queries: Vec<QueryObserverOptions<T>>,
  ) -> Result<Vec<Matched<T>>, QueryError> {
    let defaulted: Vec<_> = queries
      .into_iter()
      .map(|options| self.client.default_observer_options(options))
      .collect();
    let prev_hashes: Vec<String> = prev.iter().map(|observer| observer.options().query_hash()).collect();

    let mut used = vec![false; prev.len()];
    let mut slots = Vec::with_capacity(defaulted.len());
    for options in &defaulted {
      let hash = options.query_hash();
      let found = (0..prev.len()).find(|&index| !used[index] && prev_hashes[index] == hash);
      slots.push(found.map(|index| {
        used[index] = true;
        prev[index].clone()
      }));
    }

    let unmatched: Vec<_> = prev
      .iter()
      .zip(&used)
      .filter(|(_, used)| !**used)
      .map(|(observer, _)| observer.clone())
      .collect();

    let mut unmatched_index = 0;
    let mut matched = Vec::with_capacity(defaulted.len());
    for (options, slot) in defaulted.into_iter().zip(slots) {
      let observer = match slot {
        Some(observer) => observer,
        None => {
          let candidate = unmatched.get(unmatched_index).cloned();
          unmatched_index += 1;
          match candidate {
            Some(previous) if options.query.config.keeps_previous_data() => previous,
            _ => Arc::new(QueryObserver::new(&self.client, options.clone())?),
          }
        }
      };
      matched.push((options, observer));
    }
    Ok(matched)
  }

  fn subscribe_child(&self, observer: &Arc<QueryObserver<T>>) {
    let me = self.me.clone();
    let child = observer.id();
    observer.subscribe(move |result| {
      if let Some(shared) = me.upgrade() {
        shared.on_update(child, result);
      }
    });
  }

  fn on_update(&self, child: u64, result: &QueryObserverResult<T>) {
    let updated = {
      let mut inner = self.inner.lock();
      match inner.observers.iter().position(|observer| observer.id() == child) {
        Some(index) => {
          inner.result[index] = result.clone();
          true
        }
        None => false,
      }
    };
    if updated {
      self.notify();
    }
  }

  fn notify(&self) {
    let result = self.inner.lock().result.clone();
    notify_manager().batch(|| {
      for listener in self.listeners.snapshot() {
        let result = result.clone();
        notify_manager().schedule(move || listener(&result));
      }
    });
  }

  fn destroy(&self) {
    self.listeners.clear();
    let observers = self.inner.lock().observers.clone();
    for observer in observers {
      observer.destroy();
    }
  }
}
