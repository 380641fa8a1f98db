//! Policies that turn failing state into an explicit wait duration.
//!
//! The engine never busy-polls: whenever a retry is not yet due it asks the
//! policy how long to sleep. Policies cap the wait so a parked loop still
//! observes cancellation and administrative commands promptly, even when the
//! retry time is pinned to "never".

use crate::state::{FailingPartitionState, UnpartitionedState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exact time left until `retry_time`, zero if it already passed.
///
/// The deterministic core shared by the policies; exposed so hosts with their
/// own scheduling can reuse it.
pub fn time_until_retry(retry_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  retry_time
    .signed_duration_since(now)
    .to_std()
    .unwrap_or(Duration::ZERO)
}

/// Smallest accepted cap. A zero cap would turn a parked loop into a busy
/// one, so the constructors raise anything below this.
const MIN_MAX_WAIT: Duration = Duration::from_millis(1);

/// Trait for computing the wait before a failing state is due for a retry.
pub trait RetryTimePolicy: Send + Sync {
  /// Wait before a failing unpartitioned processor retries its position.
  fn for_processor(&self, state: &UnpartitionedState, now: DateTime<Utc>) -> Duration;

  /// Wait before a failing partition retries its resume position.
  fn for_partition(&self, record: &FailingPartitionState, now: DateTime<Utc>) -> Duration;
}

/// Waits exactly until the retry time, capped by a maximum idle wait.
#[derive(Clone, Debug)]
pub struct BoundedRetryTime {
  /// Upper bound on any single wait.
  pub max_wait: Duration,
}

impl BoundedRetryTime {
  /// Creates a policy with the given cap. Caps below one millisecond are
  /// raised to it.
  pub fn new(max_wait: Duration) -> Self {
    Self {
      max_wait: max_wait.max(MIN_MAX_WAIT),
    }
  }

  /// Sets the cap, raised to one millisecond if below it.
  pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
    self.max_wait = max_wait.max(MIN_MAX_WAIT);
    self
  }
}

impl Default for BoundedRetryTime {
  fn default() -> Self {
    Self {
      max_wait: Duration::from_secs(60),
    }
  }
}

impl RetryTimePolicy for BoundedRetryTime {
  fn for_processor(&self, state: &UnpartitionedState, now: DateTime<Utc>) -> Duration {
    time_until_retry(state.retry_time, now).min(self.max_wait)
  }

  fn for_partition(&self, record: &FailingPartitionState, now: DateTime<Utc>) -> Duration {
    time_until_retry(record.retry_time, now).min(self.max_wait)
  }
}

/// Like [`BoundedRetryTime`], with a random smear added to each wait.
///
/// Useful when many processors share a store or a downstream dependency and
/// their retries would otherwise land in the same instant. A due retry is
/// never delayed: the smear only applies while there is still time left.
#[derive(Clone, Debug)]
pub struct JitteredRetryTime {
  /// Upper bound on any single wait.
  pub max_wait: Duration,
  /// Largest smear added to a pending wait.
  pub jitter: Duration,
}

impl JitteredRetryTime {
  /// Creates a policy with the given cap and smear. Caps below one
  /// millisecond are raised to it.
  pub fn new(max_wait: Duration, jitter: Duration) -> Self {
    Self {
      max_wait: max_wait.max(MIN_MAX_WAIT),
      jitter,
    }
  }

  fn smeared(&self, retry_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let base = time_until_retry(retry_time, now);
    if base.is_zero() {
      return Duration::ZERO;
    }
    let smear = self.jitter.mul_f64(rand::random::<f64>());
    (base + smear).min(self.max_wait)
  }
}

impl RetryTimePolicy for JitteredRetryTime {
  fn for_processor(&self, state: &UnpartitionedState, now: DateTime<Utc>) -> Duration {
    self.smeared(state.retry_time, now)
  }

  fn for_partition(&self, record: &FailingPartitionState, now: DateTime<Utc>) -> Duration {
    self.smeared(record.retry_time, now)
  }
}
