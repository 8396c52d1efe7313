use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::TaskSpawner;
use crate::task::timer::Timeout;
use crate::time::is_finite;

/// Default time an unused entry is kept before collection.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

struct RemovableState {
  cache_time: Option<Duration>,
  gc: Option<Timeout>,
}

/// The inactivity timer shared by queries and mutations.
///
/// The effective cache time is the maximum ever requested, so an entry shared
/// by several consumers lives as long as the most demanding one asks for.
pub(crate) struct Removable {
  spawner: Arc<dyn TaskSpawner>,
  state: Mutex<RemovableState>,
}

impl Removable {
  pub(crate) fn new(spawner: Arc<dyn TaskSpawner>) -> Self {
    Self {
      spawner,
      state: Mutex::new(RemovableState {
        cache_time: None,
        gc: None,
      }),
    }
  }

  pub(crate) fn update_cache_time(&self, requested: Option<Duration>) {
    let requested = requested.unwrap_or(DEFAULT_CACHE_TIME);
    let mut state = self.state.lock();
    state.cache_time = Some(state.cache_time.map_or(requested, |current| current.max(requested)));
  }

  pub(crate) fn cache_time(&self) -> Duration {
    self.state.lock().cache_time.unwrap_or(DEFAULT_CACHE_TIME)
  }

  /// Arms (or re-arms) the collection timer. An infinite cache time never
  /// arms one.
  pub(crate) fn schedule_gc<F>(&self, on_expire: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut state = self.state.lock();
    state.gc = None;
    let cache_time = state.cache_time.unwrap_or(DEFAULT_CACHE_TIME);
    if is_finite(cache_time) {
      state.gc = Some(Timeout::schedule(self.spawner.as_ref(), cache_time, on_expire));
    }
  }

  pub(crate) fn clear_gc_timeout(&self) {
    if let Some(timeout) = self.state.lock().gc.take() {
      timeout.cancel();
    }
  }
}
