//! Exporting cache contents to a serializable snapshot and importing them
//! back, for example to hand server-fetched data to a client.
//!
//! Query data is carried as [`serde_json::Value`], so one snapshot can hold
//! queries of different types. Both directions are typed: [`dehydrate`]
//! exports the queries holding a `T`, [`hydrate`] imports the entries whose
//! data decodes as a `T`.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::filters::{MutationPredicate, QueryPredicate};
use crate::key::QueryKey;
use crate::mutation::{CachedMutation, MutationStatus};
use crate::notify::notify_manager;
use crate::options::{QueryData, QueryOptions};
use crate::query::{CachedQuery, FetchStatus, QueryState, QueryStatus};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedState {
  pub mutations: Vec<DehydratedMutation>,
  pub queries: Vec<DehydratedQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
  pub query_hash: String,
  pub query_key: QueryKey,
  pub state: DehydratedQueryState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryState {
  pub data: Option<Value>,
  pub data_update_count: u32,
  pub data_updated_at: u64,
  /// The error message, when the query failed.
  pub error: Option<String>,
  pub error_update_count: u32,
  pub error_updated_at: u64,
  pub failure_count: u32,
  pub is_invalidated: bool,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
}

/// A mutation summary. Mutations are exported for inspection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
  pub mutation_key: Option<QueryKey>,
  pub state: DehydratedMutationState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutationState {
  pub status: MutationStatus,
  pub is_paused: bool,
  pub failure_count: u32,
  pub submitted_at: u64,
}

/// Which entries [`dehydrate`] exports. By default successful queries and
/// paused mutations.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
  pub should_dehydrate_query: Option<QueryPredicate>,
  pub should_dehydrate_mutation: Option<MutationPredicate>,
}

impl fmt::Debug for DehydrateOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DehydrateOptions")
      .field("should_dehydrate_query", &self.should_dehydrate_query.is_some())
      .field("should_dehydrate_mutation", &self.should_dehydrate_mutation.is_some())
      .finish()
  }
}

impl DehydrateOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn should_dehydrate_query(mut self, f: impl Fn(&dyn CachedQuery) -> bool + Send + Sync + 'static) -> Self {
    self.should_dehydrate_query = Some(Arc::new(f));
    self
  }

  pub fn should_dehydrate_mutation(mut self, f: impl Fn(&dyn CachedMutation) -> bool + Send + Sync + 'static) -> Self {
    self.should_dehydrate_mutation = Some(Arc::new(f));
    self
  }

  fn keeps_query(&self, query: &dyn CachedQuery) -> bool {
    match &self.should_dehydrate_query {
      Some(f) => f(query),
      None => query.status() == QueryStatus::Success,
    }
  }

  fn keeps_mutation(&self, mutation: &dyn CachedMutation) -> bool {
    match &self.should_dehydrate_mutation {
      Some(f) => f(mutation),
      None => mutation.is_paused(),
    }
  }
}

/// Exports the matching mutations and the matching queries holding a `T`.
pub fn dehydrate<T>(client: &QueryClient, options: &DehydrateOptions) -> Result<DehydratedState, QueryError>
where
  T: QueryData + Serialize,
{
  let mut state = DehydratedState {
    mutations: dehydrate_mutations(client, options),
    queries: Vec::new(),
  };
  state.extend_queries::<T>(client, options)?;
  Ok(state)
}

impl DehydratedState {
  /// Adds the matching queries holding a `T`, so one snapshot can carry
  /// several data types.
  pub fn extend_queries<T>(&mut self, client: &QueryClient, options: &DehydrateOptions) -> Result<(), QueryError>
  where
    T: QueryData + Serialize,
  {
    for query in client.query_cache().get_all() {
      if !options.keeps_query(query.as_ref()) {
        continue;
      }
      let Some(typed) = client.query_cache().get_typed::<T>(query.query_hash()) else {
        continue;
      };
      self.queries.push(DehydratedQuery {
        query_hash: typed.query_hash().to_string(),
        query_key: typed.query_key().clone(),
        state: dehydrate_query_state(&typed.state())?,
      });
    }
    tracing::debug!(queries = self.queries.len(), "queries dehydrated");
    Ok(())
  }
}

fn dehydrate_mutations(client: &QueryClient, options: &DehydrateOptions) -> Vec<DehydratedMutation> {
  client
    .mutation_cache()
    .get_all()
    .into_iter()
    .filter(|mutation| options.keeps_mutation(mutation.as_ref()))
    .map(|mutation| DehydratedMutation {
      mutation_key: mutation.mutation_key().cloned(),
      state: DehydratedMutationState {
        status: mutation.status(),
        is_paused: mutation.is_paused(),
        failure_count: mutation.failure_count(),
        submitted_at: mutation.submitted_at(),
      },
    })
    .collect()
}

fn dehydrate_query_state<T: Serialize>(state: &QueryState<T>) -> Result<DehydratedQueryState, QueryError> {
  let data = state
    .data
    .as_deref()
    .map(serde_json::to_value)
    .transpose()
    .map_err(QueryError::from_error)?;
  Ok(DehydratedQueryState {
    data,
    data_update_count: state.data_update_count,
    data_updated_at: state.data_updated_at,
    error: state.error.as_ref().map(|error| error.to_string()),
    error_update_count: state.error_update_count,
    error_updated_at: state.error_updated_at,
    failure_count: state.failure_count,
    is_invalidated: state.is_invalidated,
    status: state.status,
    fetch_status: state.fetch_status,
  })
}

/// Imports the queries of `state` whose data decodes as a `T`.
///
/// A cached query only takes the incoming state when it is newer than what it
/// holds. Unknown queries are created idle and are not fetched. Entries that
/// do not decode as a `T`, or belong to a query of another type, are skipped.
pub fn hydrate<T>(client: &QueryClient, state: &DehydratedState)
where
  T: QueryData + DeserializeOwned,
{
  let cache = client.query_cache();
  let mut applied = 0usize;
  notify_manager().batch(|| {
    for dehydrated in &state.queries {
      let existing = cache.get(&dehydrated.query_hash);
      let typed = existing
        .as_ref()
        .and_then(|_| cache.get_typed::<T>(&dehydrated.query_hash));
      if existing.is_some() && typed.is_none() {
        continue;
      }
      if dehydrated.state.data.is_none() && typed.is_none() {
        continue;
      }

      let incoming = match hydrate_query_state::<T>(&dehydrated.state) {
        Ok(incoming) => incoming,
        Err(error) => {
          tracing::trace!(query_hash = %dehydrated.query_hash, error = %error, "dehydrated query skipped");
          continue;
        }
      };

      match typed {
        Some(query) => {
          let current = query.state();
          if current.data_updated_at < incoming.data_updated_at {
            query.set_state(QueryState {
              fetch_status: current.fetch_status,
              fetch_meta: current.fetch_meta,
              ..incoming
            });
            applied += 1;
          }
        }
        None => {
          let mut options = client.default_query_options(QueryOptions::<T>::new(dehydrated.query_key.clone()));
          options.query_hash = Some(dehydrated.query_hash.clone());
          if cache.build(&options, Some(incoming)).is_ok() {
            applied += 1;
          }
        }
      }
    }
  });

  if !state.mutations.is_empty() {
    tracing::debug!(
      mutations = state.mutations.len(),
      "dehydrated mutations are not re-created"
    );
  }
  tracing::debug!(queries = applied, "queries hydrated");
}

fn hydrate_query_state<T: DeserializeOwned>(state: &DehydratedQueryState) -> Result<QueryState<T>, QueryError> {
  let data = state
    .data
    .clone()
    .map(serde_json::from_value::<T>)
    .transpose()
    .map_err(QueryError::from_error)?;
  Ok(QueryState {
    data: data.map(Arc::new),
    data_update_count: state.data_update_count,
    data_updated_at: state.data_updated_at,
    error: state.error.clone().map(QueryError::Fetch),
    error_update_count: state.error_update_count,
    error_updated_at: state.error_updated_at,
    failure_count: state.failure_count,
    failure_reason: None,
    fetch_meta: None,
    is_invalidated: state.is_invalidated,
    status: state.status,
    fetch_status: FetchStatus::Idle,
  })
}
