//! Outcome contract between the engine and a pluggable event processor.

use std::time::Duration;

/// Outcome of one processing attempt, produced once per attempt.
///
/// A failure carries whether the engine should retry and how long to wait
/// before the retry is due. A failure with `retry = false` is fatal for that
/// position or partition, not for the whole processor: the engine pins the
/// retry time to the maximum representable instant and keeps running, and only
/// an administrative reset resumes the pinned position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
  /// The event was handled; the processor may advance past it.
  Successful,
  /// The event was not handled.
  Failed {
    /// Description of what went wrong, replayed to the processor on retry.
    reason: String,
    /// Whether the engine should retry this position automatically.
    retry: bool,
    /// Wait before the retry is due. Ignored when `retry` is false.
    retry_timeout: Duration,
  },
}

impl ProcessingResult {
  /// A successful attempt.
  pub fn succeeded() -> Self {
    ProcessingResult::Successful
  }

  /// A retryable failure, due again after `retry_timeout`.
  pub fn retry(reason: impl Into<String>, retry_timeout: Duration) -> Self {
    ProcessingResult::Failed {
      reason: reason.into(),
      retry: true,
      retry_timeout,
    }
  }

  /// A failure that must not be retried automatically.
  pub fn fatal(reason: impl Into<String>) -> Self {
    ProcessingResult::Failed {
      reason: reason.into(),
      retry: false,
      retry_timeout: Duration::ZERO,
    }
  }

  /// Whether this attempt succeeded.
  pub fn is_successful(&self) -> bool {
    matches!(self, ProcessingResult::Successful)
  }
}
