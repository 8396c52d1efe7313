//! An in-memory async query cache and synchronization engine.
//!
//! # Features
//! - **Deduplicated fetches**: concurrent requests for one key share a single
//!   in-flight future.
//! - **Staleness & GC**: data goes stale after a configurable time and unused
//!   entries are garbage collected after their cache time.
//! - **Observers**: [`QueryObserver`] and [`QueriesObserver`] derive
//!   structurally shared results and refetch on mount, focus, reconnect or an
//!   interval.
//! - **Retries**: exponential backoff, pausing while unfocused or offline.
//! - **Mutations**: lifecycle callbacks, optimistic context, paused mutations
//!   resumed in submission order.
//! - **Pagination**: infinite queries fetching pages forwards and backwards.
//! - **Hydration**: optional `serde` feature for exporting and importing cache
//!   state.
//!
//! Everything runs on tokio; the ambient runtime is used unless a
//! [`TaskSpawner`] is supplied through [`QueryClientBuilder`].

// Public modules that form the API
pub mod client;
pub mod error;
pub mod filters;
pub mod focus_manager;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod mutation_cache;
pub mod mutation_observer;
pub mod notify;
pub mod observer;
pub mod online_manager;
pub mod options;
pub mod queries_observer;
pub mod query;
pub mod query_cache;
pub mod retryer;
pub mod runtime;
pub mod signal;
pub mod subscribable;

#[cfg(feature = "serde")]
pub mod hydration;

// Internal, crate-only modules
mod removable;
mod task;
mod time;

pub use client::{DefaultOptions, QueryClient, QueryClientBuilder};
pub use error::{CancelOptions, CancelledError, QueryError};
pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use focus_manager::{focus_manager, FocusManager};
pub use infinite::{
  FetchPageOptions, InfiniteData, InfiniteQueryBehavior, InfiniteQueryObserver, InfiniteQueryOptions,
  InfiniteQueryResult,
};
pub use key::QueryKey;
pub use mutation::{
  CachedMutation, Mutation, MutationConfig, MutationFuture, MutationOptions, MutationState, MutationStatus,
};
pub use mutation_cache::{MutationCache, MutationCacheConfig, MutationCacheEvent};
pub use mutation_observer::{MutateOptions, MutationObserver, MutationObserverResult};
pub use notify::{notify_manager, NotifyManager};
pub use observer::{QueryObserver, QueryObserverResult, ResultField, TrackedResult};
pub use online_manager::{online_manager, OnlineManager};
pub use options::{
  FetchDirection, FetchOptions, InvalidateOptions, NotifyOnChangeProps, QueryConfig, QueryData,
  QueryFunctionContext, QueryObserverOptions, QueryOptions, RefetchOn, RefetchOptions, RefetchType,
  SetDataOptions,
};
pub use queries_observer::QueriesObserver;
pub use query::{CachedQuery, FetchStatus, Query, QueryFuture, QueryState, QueryStatus};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};
pub use retryer::{NetworkMode, Retry, RetryDelay};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use signal::SignalHandle;
pub use subscribable::ListenerId;

#[cfg(feature = "serde")]
pub use hydration::{dehydrate, hydrate, DehydrateOptions, DehydratedState};

#[doc(hidden)]
pub use serde_json as __serde_json;
