use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identifies a registered listener so it can be removed again.
pub type ListenerId = u64;

/// A multi-listener registry.
///
/// Listeners are stored as `Arc<L>` so a snapshot can be taken and invoked
/// without holding the registry lock.
pub struct Subscribable<L: ?Sized> {
  next_id: AtomicU64,
  listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Subscribable<L> {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      listeners: Mutex::new(Vec::new()),
    }
  }

  /// Registers a listener, returning the id needed to unsubscribe.
  pub fn subscribe(&self, listener: Arc<L>) -> ListenerId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.listeners.lock().push((id, listener));
    id
  }

  /// Removes a listener. Returns false if it was not registered.
  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    let mut listeners = self.listeners.lock();
    let before = listeners.len();
    listeners.retain(|(listener_id, _)| *listener_id != id);
    listeners.len() != before
  }

  pub fn has_listeners(&self) -> bool {
    !self.listeners.lock().is_empty()
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.lock().len()
  }

  /// The current listeners, in registration order.
  pub fn snapshot(&self) -> Vec<Arc<L>> {
    self
      .listeners
      .lock()
      .iter()
      .map(|(_, listener)| listener.clone())
      .collect()
  }

  pub fn clear(&self) {
    self.listeners.lock().clear();
  }
}

impl<L: ?Sized> Default for Subscribable<L> {
  fn default() -> Self {
    Self::new()
  }
}
