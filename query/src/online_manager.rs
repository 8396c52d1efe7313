use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::signal::{Cleanup, SignalCore, SignalHandle};
use crate::subscribable::ListenerId;

static ONLINE_MANAGER: Lazy<OnlineManager> = Lazy::new(OnlineManager::new);

/// The process-wide connectivity signal.
pub fn online_manager() -> &'static OnlineManager {
  &ONLINE_MANAGER
}

/// Tracks network connectivity. Online unless told otherwise.
pub struct OnlineManager {
  core: Arc<SignalCore>,
}

impl OnlineManager {
  pub fn new() -> Self {
    Self {
      core: SignalCore::new("online"),
    }
  }

  pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
    self.core.subscribe(Arc::new(listener))
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.core.unsubscribe(id)
  }

  pub fn has_listeners(&self) -> bool {
    self.core.has_listeners()
  }

  pub fn set_event_listener<F>(&self, setup: F)
  where
    F: Fn(SignalHandle) -> Option<Cleanup> + Send + Sync + 'static,
  {
    self.core.set_event_listener(Arc::new(setup));
  }

  pub fn set_online(&self, online: Option<bool>) {
    self.core.set(online);
  }

  pub fn on_online(&self) {
    self.core.emit();
  }

  pub fn is_online(&self) -> bool {
    self.core.get()
  }
}

impl Default for OnlineManager {
  fn default() -> Self {
    Self::new()
  }
}
