use once_cell::sync::Lazy;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

// Wall-clock anchor paired with a monotonic instant, captured on first use.
// Timestamps advance with the tokio clock so paused test runtimes move them too.
static QUERY_EPOCH: Lazy<(u64, Instant)> = Lazy::new(|| {
  let wall = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default();
  (wall, Instant::now())
});

/// Milliseconds since the UNIX epoch. Never returns 0, which is reserved for
/// "never updated".
#[inline]
pub fn now_millis() -> u64 {
  let (wall, anchor) = *QUERY_EPOCH;
  let elapsed = Instant::now().saturating_duration_since(anchor).as_millis() as u64;
  wall.saturating_add(elapsed).max(1)
}

#[inline]
pub(crate) fn duration_millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Remaining time until data updated at `updated_at` turns stale.
pub(crate) fn time_until_stale(updated_at: u64, stale_time: Duration) -> Duration {
  let stale_at = updated_at.saturating_add(duration_millis(stale_time));
  Duration::from_millis(stale_at.saturating_sub(now_millis()))
}

/// `Duration::MAX` is used as "never" for stale and cache times.
#[inline]
pub(crate) fn is_finite(duration: Duration) -> bool {
  duration != Duration::MAX
}
