//! The retry loop around one asynchronous unit of work.
//!
//! A [`Retryer`] runs the work, retries failures with backoff, pauses while
//! the process is unfocused or offline, and settles exactly once: either with
//! the work's outcome or, if cancelled first, with a [`CancelledError`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, Either, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelOptions, CancelledError, QueryError};
use crate::focus_manager::focus_manager;
use crate::online_manager::online_manager;

/// Decides whether a failed attempt is retried.
pub type RetryFn = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;
/// Computes the delay before the next attempt.
pub type RetryDelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// Retry policy. The failure count handed to `When` is the number of failures
/// before the current one.
#[derive(Clone)]
pub enum Retry {
  Never,
  Always,
  Count(u32),
  When(RetryFn),
}

impl Retry {
  pub fn when(f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
    Retry::When(Arc::new(f))
  }

  pub(crate) fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
    match self {
      Retry::Never => false,
      Retry::Always => true,
      Retry::Count(max) => failure_count < *max,
      Retry::When(f) => f(failure_count, error),
    }
  }
}

impl From<bool> for Retry {
  fn from(retry: bool) -> Self {
    if retry {
      Retry::Always
    } else {
      Retry::Never
    }
  }
}

impl From<u32> for Retry {
  fn from(count: u32) -> Self {
    Retry::Count(count)
  }
}

impl fmt::Debug for Retry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Retry::Never => write!(f, "Never"),
      Retry::Always => write!(f, "Always"),
      Retry::Count(n) => write!(f, "Count({n})"),
      Retry::When(_) => write!(f, "When(..)"),
    }
  }
}

#[derive(Clone, Default)]
pub enum RetryDelay {
  /// `min(1000 * 2^failure_count, 30000)` milliseconds.
  #[default]
  Exponential,
  Fixed(Duration),
  Custom(RetryDelayFn),
}

impl RetryDelay {
  pub fn custom(f: impl Fn(u32, &QueryError) -> Duration + Send + Sync + 'static) -> Self {
    RetryDelay::Custom(Arc::new(f))
  }

  pub(crate) fn delay(&self, failure_count: u32, error: &QueryError) -> Duration {
    match self {
      RetryDelay::Exponential => default_retry_delay(failure_count),
      RetryDelay::Fixed(delay) => *delay,
      RetryDelay::Custom(f) => f(failure_count, error),
    }
  }
}

impl From<Duration> for RetryDelay {
  fn from(delay: Duration) -> Self {
    RetryDelay::Fixed(delay)
  }
}

impl fmt::Debug for RetryDelay {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RetryDelay::Exponential => write!(f, "Exponential"),
      RetryDelay::Fixed(d) => write!(f, "Fixed({d:?})"),
      RetryDelay::Custom(_) => write!(f, "Custom(..)"),
    }
  }
}

pub fn default_retry_delay(failure_count: u32) -> Duration {
  let millis = 2u64
    .saturating_pow(failure_count)
    .saturating_mul(1000)
    .min(30_000);
  Duration::from_millis(millis)
}

/// How fetching interacts with connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum NetworkMode {
  /// Never fetch while offline; start paused instead.
  #[default]
  Online,
  /// Ignore connectivity entirely.
  Always,
  /// Run the first attempt regardless, pause retries while offline.
  OfflineFirst,
}

pub(crate) fn can_fetch(network_mode: NetworkMode) -> bool {
  network_mode != NetworkMode::Online || online_manager().is_online()
}

fn should_pause(network_mode: NetworkMode) -> bool {
  !focus_manager().is_focused()
    || (network_mode != NetworkMode::Always && !online_manager().is_online())
}

/// An optional abort capability attached to an operation.
pub trait Cancel: Send + Sync {
  fn cancel(&self);
}

impl Cancel for CancellationToken {
  fn cancel(&self) {
    CancellationToken::cancel(self)
  }
}

pub(crate) type RunFn<O> = Arc<dyn Fn() -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync>;
pub type SharedResult<O> = Shared<BoxFuture<'static, Result<O, QueryError>>>;

pub(crate) struct RetryerConfig<O> {
  pub(crate) run: RunFn<O>,
  pub(crate) abort: Option<Arc<dyn Cancel>>,
  pub(crate) retry: Retry,
  pub(crate) retry_delay: RetryDelay,
  pub(crate) network_mode: NetworkMode,
  pub(crate) on_fail: Option<Box<dyn Fn(u32, &QueryError) + Send + Sync>>,
  pub(crate) on_pause: Option<Box<dyn Fn() + Send + Sync>>,
  pub(crate) on_continue: Option<Box<dyn Fn() + Send + Sync>>,
  pub(crate) on_success: Option<Box<dyn FnOnce(&O) + Send>>,
  pub(crate) on_error: Option<Box<dyn FnOnce(&QueryError) + Send>>,
}

impl<O> RetryerConfig<O> {
  pub(crate) fn new(run: RunFn<O>) -> Self {
    Self {
      run,
      abort: None,
      retry: Retry::Never,
      retry_delay: RetryDelay::Exponential,
      network_mode: NetworkMode::Online,
      on_fail: None,
      on_pause: None,
      on_continue: None,
      on_success: None,
      on_error: None,
    }
  }
}

struct Settle<O> {
  on_success: Option<Box<dyn FnOnce(&O) + Send>>,
  on_error: Option<Box<dyn FnOnce(&QueryError) + Send>>,
}

struct RetryerState<O> {
  failure_count: AtomicU32,
  is_retry_cancelled: AtomicBool,
  is_resolved: AtomicBool,
  cancelled: Mutex<Option<CancelledError>>,
  token: CancellationToken,
  resume: Notify,
  abort: Option<Arc<dyn Cancel>>,
  settle: Mutex<Option<Settle<O>>>,
}

impl<O> RetryerState<O> {
  /// Runs the settle callbacks for `outcome`. Only the first caller wins.
  fn settle(&self, outcome: &Result<O, QueryError>) -> bool {
    if self.is_resolved.swap(true, Ordering::SeqCst) {
      return false;
    }
    let settle = self.settle.lock().take();
    if let Some(settle) = settle {
      match outcome {
        Ok(value) => {
          if let Some(on_success) = settle.on_success {
            on_success(value);
          }
        }
        Err(error) => {
          if let Some(on_error) = settle.on_error {
            on_error(error);
          }
        }
      }
    }
    true
  }

  fn cancelled_error(&self) -> QueryError {
    QueryError::Cancelled(self.cancelled.lock().unwrap_or(CancelledError {
      revert: false,
      silent: false,
    }))
  }
}

/// Handle to one retry loop. Cloning shares the same loop.
pub(crate) struct Retryer<O> {
  state: Arc<RetryerState<O>>,
  promise: SharedResult<O>,
}

impl<O> Clone for Retryer<O> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
      promise: self.promise.clone(),
    }
  }
}

impl<O> Retryer<O>
where
  O: Clone + Send + Sync + 'static,
{
  /// Prepares the loop. Nothing runs until the returned promise is polled.
  pub(crate) fn new(config: RetryerConfig<O>) -> Self {
    let RetryerConfig {
      run,
      abort,
      retry,
      retry_delay,
      network_mode,
      on_fail,
      on_pause,
      on_continue,
      on_success,
      on_error,
    } = config;

    let state = Arc::new(RetryerState {
      failure_count: AtomicU32::new(0),
      is_retry_cancelled: AtomicBool::new(false),
      is_resolved: AtomicBool::new(false),
      cancelled: Mutex::new(None),
      token: CancellationToken::new(),
      resume: Notify::new(),
      abort,
      settle: Mutex::new(Some(Settle {
        on_success,
        on_error,
      })),
    });

    let loop_state = state.clone();
    let promise = async move {
      let hooks = LoopHooks {
        on_fail,
        on_pause,
        on_continue,
      };
      let work = Box::pin(run_loop(&loop_state, &run, &retry, &retry_delay, network_mode, &hooks));
      let cancelled = Box::pin(loop_state.token.cancelled());
      let outcome = match future::select(work, cancelled).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right(((), _)) => Err(loop_state.cancelled_error()),
      };
      if loop_state.settle(&outcome) {
        outcome
      } else {
        // Cancelled while the last attempt was finishing; the late result is dropped.
        Err(loop_state.cancelled_error())
      }
    }
    .boxed()
    .shared();

    Self { state, promise }
  }

  pub(crate) fn promise(&self) -> SharedResult<O> {
    self.promise.clone()
  }

  /// Settles the loop with a cancellation right away and stops the work.
  pub(crate) fn cancel(&self, options: CancelOptions) {
    if self.state.is_resolved.load(Ordering::SeqCst) {
      return;
    }
    *self.state.cancelled.lock() = Some(options.into());
    let error = self.state.cancelled_error();
    if self.state.settle(&Err(error)) {
      if let Some(abort) = &self.state.abort {
        abort.cancel();
      }
      self.state.token.cancel();
      self.state.resume.notify_one();
    }
  }

  /// Lets the current attempt finish but stops further retries.
  pub(crate) fn cancel_retry(&self) {
    self.state.is_retry_cancelled.store(true, Ordering::SeqCst);
  }

  pub(crate) fn continue_retry(&self) {
    self.state.is_retry_cancelled.store(false, Ordering::SeqCst);
  }

  /// Wakes a paused loop so it can re-check whether it may continue.
  pub(crate) fn continue_execution(&self) {
    self.state.resume.notify_one();
  }
}

struct LoopHooks {
  on_fail: Option<Box<dyn Fn(u32, &QueryError) + Send + Sync>>,
  on_pause: Option<Box<dyn Fn() + Send + Sync>>,
  on_continue: Option<Box<dyn Fn() + Send + Sync>>,
}

async fn run_loop<O>(
  state: &RetryerState<O>,
  run: &RunFn<O>,
  retry: &Retry,
  retry_delay: &RetryDelay,
  network_mode: NetworkMode,
  hooks: &LoopHooks,
) -> Result<O, QueryError> {
  if !can_fetch(network_mode) {
    pause(state, network_mode, hooks).await;
  }

  loop {
    let error = match run().await {
      Ok(value) => return Ok(value),
      Err(error) => error,
    };

    let failure_count = state.failure_count.load(Ordering::SeqCst);
    if state.is_retry_cancelled.load(Ordering::SeqCst) || !retry.should_retry(failure_count, &error) {
      return Err(error);
    }

    let failure_count = failure_count + 1;
    state.failure_count.store(failure_count, Ordering::SeqCst);
    tracing::debug!(failure_count, error = %error, "attempt failed, retrying");
    if let Some(on_fail) = &hooks.on_fail {
      on_fail(failure_count, &error);
    }

    if !should_pause(network_mode) {
      tokio::time::sleep(retry_delay.delay(failure_count - 1, &error)).await;
    }
    if should_pause(network_mode) {
      pause(state, network_mode, hooks).await;
    }

    if state.is_retry_cancelled.load(Ordering::SeqCst) {
      return Err(error);
    }
  }
}

async fn pause<O>(state: &RetryerState<O>, network_mode: NetworkMode, hooks: &LoopHooks) {
  tracing::debug!("paused until focus and connectivity return");
  if let Some(on_pause) = &hooks.on_pause {
    on_pause();
  }

  loop {
    if state.is_resolved.load(Ordering::SeqCst) {
      break;
    }
    let can_continue = if state.failure_count.load(Ordering::SeqCst) == 0 {
      can_fetch(network_mode)
    } else {
      !should_pause(network_mode)
    };
    if can_continue {
      break;
    }
    state.resume.notified().await;
  }

  if !state.is_resolved.load(Ordering::SeqCst) {
    if let Some(on_continue) = &hooks.on_continue {
      on_continue();
    }
  }
}
