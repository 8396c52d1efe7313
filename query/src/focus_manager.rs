use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::signal::{Cleanup, SignalCore, SignalHandle};
use crate::subscribable::ListenerId;

static FOCUS_MANAGER: Lazy<FocusManager> = Lazy::new(FocusManager::new);

/// The process-wide focus signal.
pub fn focus_manager() -> &'static FocusManager {
  &FOCUS_MANAGER
}

/// Tracks whether the consumer of the cache is in the foreground.
///
/// Without a host detector or a manual override the process counts as
/// focused.
pub struct FocusManager {
  core: Arc<SignalCore>,
}

impl FocusManager {
  pub fn new() -> Self {
    Self {
      core: SignalCore::new("focus"),
    }
  }

  /// Registers a listener called whenever focus is (re)gained or reported.
  pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
    self.core.subscribe(Arc::new(listener))
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.core.unsubscribe(id)
  }

  pub fn has_listeners(&self) -> bool {
    self.core.has_listeners()
  }

  /// Installs host focus detection. Any previous detector is cleaned up.
  pub fn set_event_listener<F>(&self, setup: F)
  where
    F: Fn(SignalHandle) -> Option<Cleanup> + Send + Sync + 'static,
  {
    self.core.set_event_listener(Arc::new(setup));
  }

  /// Overrides the detected state; `None` returns to the host default.
  pub fn set_focused(&self, focused: Option<bool>) {
    self.core.set(focused);
  }

  /// Re-notifies listeners without changing the state.
  pub fn on_focus(&self) {
    self.core.emit();
  }

  pub fn is_focused(&self) -> bool {
    self.core.get()
  }
}

impl Default for FocusManager {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn listeners_fire_only_on_change() {
    let manager = FocusManager::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = manager.subscribe(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });

    assert!(manager.is_focused());
    manager.set_focused(Some(true));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    manager.set_focused(Some(true));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    manager.set_focused(Some(false));
    assert!(!manager.is_focused());
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    manager.unsubscribe(id);
    manager.set_focused(None);
    assert!(manager.is_focused());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn event_listener_is_installed_and_cleaned_up() {
    let manager = FocusManager::new();
    let cleaned = Arc::new(AtomicUsize::new(0));
    let handle_slot = Arc::new(parking_lot::Mutex::new(None));
    {
      let cleaned = cleaned.clone();
      let handle_slot = handle_slot.clone();
      manager.set_event_listener(move |handle| {
        *handle_slot.lock() = Some(handle);
        let cleaned = cleaned.clone();
        Some(Box::new(move || {
          cleaned.fetch_add(1, Ordering::SeqCst);
        }) as Cleanup)
      });
    }

    let id = manager.subscribe(|| {});
    let handle = handle_slot.lock().clone().expect("setup ran");
    handle.set(false);
    assert!(!manager.is_focused());
    handle.set(true);
    assert!(manager.is_focused());

    manager.unsubscribe(id);
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
  }
}
