use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::subscribable::{ListenerId, Subscribable};

/// Undoes whatever an event-listener setup registered.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Installs host detection for a signal and optionally returns a cleanup.
pub type SetupFn = Arc<dyn Fn(SignalHandle) -> Option<Cleanup> + Send + Sync>;

type Listener = dyn Fn() + Send + Sync;

/// Handed to an event-listener setup so the host can report changes.
#[derive(Clone)]
pub struct SignalHandle {
  core: Weak<SignalCore>,
}

impl SignalHandle {
  /// Reports an explicit value.
  pub fn set(&self, value: bool) {
    if let Some(core) = self.core.upgrade() {
      core.set(Some(value));
    }
  }

  /// Reports that the host observed an event without a definite value.
  /// Listeners are re-notified.
  pub fn signal(&self) {
    if let Some(core) = self.core.upgrade() {
      core.emit();
    }
  }
}

/// Shared machinery of the focus and online managers: a tri-state value
/// (`None` = follow the host default), a listener registry, and a lazily
/// installed host detector that lives as long as somebody listens.
pub(crate) struct SignalCore {
  me: Weak<SignalCore>,
  name: &'static str,
  value: Mutex<Option<bool>>,
  listeners: Subscribable<Listener>,
  setup: Mutex<Option<SetupFn>>,
  cleanup: Mutex<Option<Cleanup>>,
}

impl SignalCore {
  pub(crate) fn new(name: &'static str) -> Arc<Self> {
    Arc::new_cyclic(|me| SignalCore {
      me: me.clone(),
      name,
      value: Mutex::new(None),
      listeners: Subscribable::new(),
      setup: Mutex::new(None),
      cleanup: Mutex::new(None),
    })
  }

  pub(crate) fn subscribe(&self, listener: Arc<Listener>) -> ListenerId {
    let id = self.listeners.subscribe(listener);
    if self.listeners.listener_count() == 1 && self.cleanup.lock().is_none() {
      let setup = self.setup.lock().clone();
      if let Some(setup) = setup {
        self.install(setup);
      }
    }
    id
  }

  pub(crate) fn unsubscribe(&self, id: ListenerId) {
    self.listeners.unsubscribe(id);
    if !self.listeners.has_listeners() {
      let cleanup = self.cleanup.lock().take();
      if let Some(cleanup) = cleanup {
        cleanup();
      }
    }
  }

  pub(crate) fn has_listeners(&self) -> bool {
    self.listeners.has_listeners()
  }

  pub(crate) fn set_event_listener(&self, setup: SetupFn) {
    *self.setup.lock() = Some(setup.clone());
    self.install(setup);
  }

  pub(crate) fn set(&self, value: Option<bool>) {
    let changed = {
      let mut current = self.value.lock();
      let changed = *current != value;
      *current = value;
      changed
    };
    if changed {
      tracing::debug!(signal = self.name, ?value, "signal changed");
      self.emit();
    }
  }

  pub(crate) fn get(&self) -> bool {
    self.value.lock().unwrap_or(true)
  }

  pub(crate) fn emit(&self) {
    for listener in self.listeners.snapshot() {
      listener();
    }
  }

  fn install(&self, setup: SetupFn) {
    let previous = self.cleanup.lock().take();
    if let Some(previous) = previous {
      previous();
    }
    let cleanup = setup(SignalHandle {
      core: self.me.clone(),
    });
    *self.cleanup.lock() = cleanup;
  }
}
