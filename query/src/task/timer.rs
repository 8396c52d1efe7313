use std::time::Duration;

use futures_util::future::{abortable, AbortHandle};

use crate::runtime::TaskSpawner;

/// A one-shot timer that runs its callback after `delay`.
///
/// Dropping or replacing the handle cancels the timer.
pub(crate) struct Timeout {
  handle: AbortHandle,
}

impl Timeout {
  pub(crate) fn schedule<F>(spawner: &dyn TaskSpawner, delay: Duration, callback: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    let (task, handle) = abortable(async move {
      tokio::time::sleep(delay).await;
      callback();
    });
    spawner.spawn(Box::pin(async move {
      let _ = task.await;
    }));
    Self { handle }
  }

  pub(crate) fn cancel(&self) {
    self.handle.abort();
  }
}

impl Drop for Timeout {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// A periodic timer. The first tick fires one `period` after scheduling.
pub(crate) struct Interval {
  handle: AbortHandle,
}

impl Interval {
  pub(crate) fn schedule<F>(spawner: &dyn TaskSpawner, period: Duration, callback: F) -> Self
  where
    F: Fn() + Send + 'static,
  {
    let (task, handle) = abortable(async move {
      loop {
        tokio::time::sleep(period).await;
        callback();
      }
    });
    spawner.spawn(Box::pin(async move {
      let _ = task.await;
    }));
    Self { handle }
  }
}

impl Drop for Interval {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
