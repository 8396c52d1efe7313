use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Options controlling how an in-flight operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelOptions {
  /// Restore the state captured right before the fetch started.
  pub revert: bool,
  /// Settle without dispatching any state change.
  pub silent: bool,
}

impl CancelOptions {
  pub fn revert() -> Self {
    Self {
      revert: true,
      silent: false,
    }
  }

  pub fn silent() -> Self {
    Self {
      revert: false,
      silent: true,
    }
  }
}

/// The outcome an operation settles with when it was cancelled.
///
/// Cancellation is a distinct outcome: it never populates a query's `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation was cancelled")]
pub struct CancelledError {
  pub revert: bool,
  pub silent: bool,
}

impl From<CancelOptions> for CancelledError {
  fn from(options: CancelOptions) -> Self {
    Self {
      revert: options.revert,
      silent: options.silent,
    }
  }
}

/// Errors produced by query and mutation functions, or by the cache itself.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
  /// The user function failed with a message.
  #[error("fetch failed: {0}")]
  Fetch(String),
  /// A transport level failure reported by the user function.
  #[error("network error: {0}")]
  Network(String),
  #[error(transparent)]
  Cancelled(#[from] CancelledError),
  /// A fetch was requested for a query that has no function and no observer
  /// able to provide one.
  #[error("missing query function for '{0}'")]
  MissingQueryFn(String),
  #[error("missing mutation function")]
  MissingMutationFn,
  /// The hash is already registered with a different data type.
  #[error("query '{0}' is registered with a different data type")]
  TypeMismatch(String),
  #[error(transparent)]
  Source(Arc<dyn StdError + Send + Sync>),
}

impl QueryError {
  pub fn fetch(message: impl Into<String>) -> Self {
    QueryError::Fetch(message.into())
  }

  pub fn network(message: impl Into<String>) -> Self {
    QueryError::Network(message.into())
  }

  /// Wraps any error type, keeping it reachable through `source()`.
  pub fn from_error<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    QueryError::Source(Arc::new(error))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, QueryError::Cancelled(_))
  }

  pub fn as_cancelled(&self) -> Option<&CancelledError> {
    match self {
      QueryError::Cancelled(cancelled) => Some(cancelled),
      _ => None,
    }
  }

  /// Identity comparison used when diffing observer results. Wrapped sources
  /// compare by pointer, everything else by value.
  pub(crate) fn same_as(&self, other: &QueryError) -> bool {
    match (self, other) {
      (QueryError::Fetch(a), QueryError::Fetch(b)) => a == b,
      (QueryError::Network(a), QueryError::Network(b)) => a == b,
      (QueryError::Cancelled(a), QueryError::Cancelled(b)) => a == b,
      (QueryError::MissingQueryFn(a), QueryError::MissingQueryFn(b)) => a == b,
      (QueryError::MissingMutationFn, QueryError::MissingMutationFn) => true,
      (QueryError::TypeMismatch(a), QueryError::TypeMismatch(b)) => a == b,
      (QueryError::Source(a), QueryError::Source(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

pub(crate) fn same_error(a: Option<&QueryError>, b: Option<&QueryError>) -> bool {
  match (a, b) {
    (None, None) => true,
    (Some(a), Some(b)) => a.same_as(b),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Error)]
  #[error("disk on fire")]
  struct DiskError;

  #[test]
  fn wrapped_sources_keep_their_message() {
    let error = QueryError::from_error(DiskError);
    assert_eq!(error.to_string(), "disk on fire");
    assert!(error.same_as(&error.clone()));
    assert!(!error.same_as(&QueryError::from_error(DiskError)));
  }

  #[test]
  fn cancellation_is_detectable() {
    let error: QueryError = CancelledError::from(CancelOptions::revert()).into();
    assert!(error.is_cancelled());
    assert_eq!(error.as_cancelled().map(|c| c.revert), Some(true));
    assert!(!QueryError::fetch("boom").is_cancelled());
  }
}
