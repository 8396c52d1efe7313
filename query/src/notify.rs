//! Notification batching.
//!
//! Every state change in the cache ends with listeners being told about it.
//! Changes that happen within one [`NotifyManager::batch`] call are queued and
//! delivered together once the outermost batch ends, in the order they were
//! scheduled.

use std::cell::RefCell;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// A queued notification.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Wraps the delivery of a single notification.
pub type NotifyFn = Arc<dyn Fn(Callback) + Send + Sync>;
/// Wraps the delivery of one flushed batch.
pub type BatchNotifyFn = Arc<dyn Fn(Callback) + Send + Sync>;
/// Decides when a delivery runs. The default runs it right away.
pub type ScheduleFn = Arc<dyn Fn(Callback) + Send + Sync>;

#[derive(Default)]
struct Transaction {
  depth: usize,
  queue: Vec<Callback>,
}

thread_local! {
  static TRANSACTION: RefCell<Transaction> = RefCell::new(Transaction::default());
}

static NOTIFY_MANAGER: Lazy<NotifyManager> = Lazy::new(NotifyManager::new);

/// The process-wide notification scheduler.
pub fn notify_manager() -> &'static NotifyManager {
  &NOTIFY_MANAGER
}

pub struct NotifyManager {
  notify_fn: RwLock<NotifyFn>,
  batch_notify_fn: RwLock<BatchNotifyFn>,
  schedule_fn: RwLock<ScheduleFn>,
}

impl NotifyManager {
  pub fn new() -> Self {
    Self {
      notify_fn: RwLock::new(Arc::new(|callback: Callback| callback())),
      batch_notify_fn: RwLock::new(Arc::new(|callback: Callback| callback())),
      schedule_fn: RwLock::new(Arc::new(|callback: Callback| callback())),
    }
  }

  /// Runs `f` inside a transaction. Notifications scheduled while it runs are
  /// flushed once the outermost transaction on this thread finishes.
  pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
    TRANSACTION.with(|transaction| transaction.borrow_mut().depth += 1);
    let result = f();
    let queue = TRANSACTION.with(|transaction| {
      let mut transaction = transaction.borrow_mut();
      transaction.depth -= 1;
      if transaction.depth == 0 {
        std::mem::take(&mut transaction.queue)
      } else {
        Vec::new()
      }
    });
    if !queue.is_empty() {
      self.flush(queue);
    }
    result
  }

  /// Queues `callback` inside a transaction, or delivers it immediately.
  pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
    let callback: Callback = Box::new(callback);
    let outside = TRANSACTION.with(|transaction| {
      let mut transaction = transaction.borrow_mut();
      if transaction.depth > 0 {
        transaction.queue.push(callback);
        None
      } else {
        Some(callback)
      }
    });

    if let Some(callback) = outside {
      let notify = self.notify_fn.read().clone();
      let schedule = self.schedule_fn.read().clone();
      schedule(Box::new(move || notify(callback)));
    }
  }

  /// Wraps `f` so that every call is routed through [`schedule`](Self::schedule).
  pub fn batch_calls<A, F>(&'static self, f: F) -> impl Fn(A) + Send + Sync
  where
    A: Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    move |arg: A| {
      let f = f.clone();
      self.schedule(move || f(arg));
    }
  }

  /// Replaces the per-notification wrapper, e.g. to catch panics or hop to
  /// another executor.
  pub fn set_notify_fn(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
    *self.notify_fn.write() = Arc::new(f);
  }

  /// Replaces the per-batch wrapper.
  pub fn set_batch_notify_fn(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
    *self.batch_notify_fn.write() = Arc::new(f);
  }

  /// Replaces the scheduling function that runs every delivery.
  pub fn set_schedule_fn(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
    *self.schedule_fn.write() = Arc::new(f);
  }

  fn flush(&self, queue: Vec<Callback>) {
    let notify = self.notify_fn.read().clone();
    let batch_notify = self.batch_notify_fn.read().clone();
    let schedule = self.schedule_fn.read().clone();
    schedule(Box::new(move || {
      batch_notify(Box::new(move || {
        for callback in queue {
          notify(callback);
        }
      }))
    }));
  }
}

impl Default for NotifyManager {
  fn default() -> Self {
    Self::new()
  }
}
