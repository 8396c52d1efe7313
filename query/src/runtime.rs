use std::{future::Future, pin::Pin};

/// A trait for spawning a future onto an asynchronous runtime.
pub trait TaskSpawner: Send + Sync + 'static {
  /// Spawns a type-erased future.
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns onto a tokio runtime.
///
/// Without a pinned handle the runtime of the calling context is used, so one
/// client can be shared by several runtimes (one per test, for instance).
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner(Option<tokio::runtime::Handle>);

impl TokioSpawner {
  /// Spawns onto whichever runtime is current at spawn time.
  pub fn new() -> Self {
    Self(None)
  }

  /// Always spawns onto the given runtime.
  pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
    Self(Some(handle))
  }
}

impl TaskSpawner for TokioSpawner {
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    match &self.0 {
      Some(handle) => {
        handle.spawn(future);
      }
      None => match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
          handle.spawn(future);
        }
        Err(_) => {
          tracing::warn!("no tokio runtime in context; background task dropped");
        }
      },
    }
  }
}
