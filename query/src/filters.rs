use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::mutation::{CachedMutation, MutationStatus};
use crate::query::{CachedQuery, FetchStatus};

pub type QueryPredicate = Arc<dyn Fn(&dyn CachedQuery) -> bool + Send + Sync>;
pub type MutationPredicate = Arc<dyn Fn(&dyn CachedMutation) -> bool + Send + Sync>;

/// Restricts matches by whether queries have enabled observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
  #[default]
  All,
  Active,
  Inactive,
}

/// Selects queries in the cache. Every set criterion must hold.
#[derive(Clone, Default)]
pub struct QueryFilters {
  pub query_key: Option<QueryKey>,
  /// Match the key hash exactly instead of by prefix. When unset the
  /// operation decides (`find` is exact, `find_all` is not).
  pub exact: Option<bool>,
  pub query_type: QueryTypeFilter,
  pub stale: Option<bool>,
  pub fetch_status: Option<FetchStatus>,
  pub predicate: Option<QueryPredicate>,
}

impl QueryFilters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn key(mut self, query_key: impl Into<QueryKey>) -> Self {
    self.query_key = Some(query_key.into());
    self
  }

  pub fn exact(mut self, exact: bool) -> Self {
    self.exact = Some(exact);
    self
  }

  pub fn query_type(mut self, query_type: QueryTypeFilter) -> Self {
    self.query_type = query_type;
    self
  }

  pub fn active(self) -> Self {
    self.query_type(QueryTypeFilter::Active)
  }

  pub fn inactive(self) -> Self {
    self.query_type(QueryTypeFilter::Inactive)
  }

  pub fn stale(mut self, stale: bool) -> Self {
    self.stale = Some(stale);
    self
  }

  pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
    self.fetch_status = Some(fetch_status);
    self
  }

  pub fn predicate(mut self, predicate: impl Fn(&dyn CachedQuery) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(predicate));
    self
  }

  pub fn matches(&self, query: &dyn CachedQuery) -> bool {
    self.matches_with_default(query, false)
  }

  pub(crate) fn matches_with_default(&self, query: &dyn CachedQuery, default_exact: bool) -> bool {
    if let Some(key) = &self.query_key {
      if self.exact.unwrap_or(default_exact) {
        if query.query_hash() != key.hash_key() {
          return false;
        }
      } else if !query.query_key().partial_matches(key) {
        return false;
      }
    }

    match self.query_type {
      QueryTypeFilter::All => {}
      QueryTypeFilter::Active if !query.is_active() => return false,
      QueryTypeFilter::Inactive if query.is_active() => return false,
      _ => {}
    }

    if let Some(stale) = self.stale {
      if query.is_stale() != stale {
        return false;
      }
    }

    if let Some(fetch_status) = self.fetch_status {
      if query.fetch_status() != fetch_status {
        return false;
      }
    }

    match &self.predicate {
      Some(predicate) => predicate(query),
      None => true,
    }
  }
}

impl From<QueryKey> for QueryFilters {
  fn from(query_key: QueryKey) -> Self {
    QueryFilters::new().key(query_key)
  }
}

impl From<&QueryKey> for QueryFilters {
  fn from(query_key: &QueryKey) -> Self {
    QueryFilters::new().key(query_key.clone())
  }
}

impl From<&str> for QueryFilters {
  fn from(query_key: &str) -> Self {
    QueryFilters::new().key(query_key)
  }
}

impl fmt::Debug for QueryFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryFilters")
      .field("query_key", &self.query_key)
      .field("exact", &self.exact)
      .field("query_type", &self.query_type)
      .field("stale", &self.stale)
      .field("fetch_status", &self.fetch_status)
      .field("has_predicate", &self.predicate.is_some())
      .finish()
  }
}

/// Selects mutations in the cache.
#[derive(Clone, Default)]
pub struct MutationFilters {
  pub mutation_key: Option<QueryKey>,
  pub exact: Option<bool>,
  /// Only mutations that are (or are not) currently pending.
  pub fetching: Option<bool>,
  pub status: Option<MutationStatus>,
  pub predicate: Option<MutationPredicate>,
}

impl MutationFilters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn key(mut self, mutation_key: impl Into<QueryKey>) -> Self {
    self.mutation_key = Some(mutation_key.into());
    self
  }

  pub fn exact(mut self, exact: bool) -> Self {
    self.exact = Some(exact);
    self
  }

  pub fn fetching(mut self, fetching: bool) -> Self {
    self.fetching = Some(fetching);
    self
  }

  pub fn status(mut self, status: MutationStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn predicate(mut self, predicate: impl Fn(&dyn CachedMutation) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(predicate));
    self
  }

  pub fn matches(&self, mutation: &dyn CachedMutation) -> bool {
    self.matches_with_default(mutation, false)
  }

  pub(crate) fn matches_with_default(&self, mutation: &dyn CachedMutation, default_exact: bool) -> bool {
    if let Some(filter_key) = &self.mutation_key {
      let Some(key) = mutation.mutation_key() else {
        return false;
      };
      if self.exact.unwrap_or(default_exact) {
        if key.hash_key() != filter_key.hash_key() {
          return false;
        }
      } else if !key.partial_matches(filter_key) {
        return false;
      }
    }

    if let Some(fetching) = self.fetching {
      if (mutation.status() == MutationStatus::Pending) != fetching {
        return false;
      }
    }

    if self.status.is_some_and(|status| mutation.status() != status) {
      return false;
    }

    match &self.predicate {
      Some(predicate) => predicate(mutation),
      None => true,
    }
  }
}

impl From<QueryKey> for MutationFilters {
  fn from(mutation_key: QueryKey) -> Self {
    MutationFilters::new().key(mutation_key)
  }
}

impl From<&str> for MutationFilters {
  fn from(mutation_key: &str) -> Self {
    MutationFilters::new().key(mutation_key)
  }
}

impl fmt::Debug for MutationFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationFilters")
      .field("mutation_key", &self.mutation_key)
      .field("exact", &self.exact)
      .field("fetching", &self.fetching)
      .field("status", &self.status)
      .field("has_predicate", &self.predicate.is_some())
      .finish()
  }
}
