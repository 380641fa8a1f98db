//! Stream processor engines: the run loops that drive durable consumption.
//!
//! Two engines share one model. [`UnpartitionedProcessor`] consumes a stream
//! strictly in order and blocks on a failing position until its retry is due.
//! [`PartitionedProcessor`] keeps the read cursor moving past events of
//! failing partitions and catches those partitions up separately, so one bad
//! partition never stalls the rest. Both interpret results through the
//! transitions in [`crate::state`] and persist after every transition; where
//! the next event comes from is delegated to an [`EventDriver`].

mod driver;
mod partitioned;
mod unpartitioned;
#[cfg(test)]
mod unpartitioned_test;

pub use driver::{EventDriver, PullDriver, PushDriver};
pub use partitioned::PartitionedProcessor;
pub use unpartitioned::UnpartitionedProcessor;

use crate::error::{ConfigError, ResetError};
use crate::event::StreamEvent;
use crate::position::ProcessingPosition;
use crate::result::ProcessingResult;
use crate::state::StreamProcessorState;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Trait for the pluggable consumer a stream processor dispatches events to.
///
/// Implementations report every per-event outcome through the returned
/// [`ProcessingResult`]; the engine turns it into checkpoint state. Errors the
/// implementation cannot express as a result (lost connections, timeouts)
/// should come back as retryable failures.
#[async_trait::async_trait]
pub trait EventProcessor: Send + Sync {
  /// Handles `event` on the first attempt at its position.
  async fn process(&self, event: &StreamEvent) -> ProcessingResult;

  /// Handles `event` again after an earlier failure at the same position,
  /// with the stored failure reason and how many retries preceded this one.
  /// Defaults to delegating to [`Self::process`].
  async fn process_retry(
    &self,
    event: &StreamEvent,
    failure_reason: &str,
    retry_count: u32,
  ) -> ProcessingResult {
    let _ = (failure_reason, retry_count);
    self.process(event).await
  }
}

/// Wait tuning for a stream processor's run loop.
#[derive(Clone, Debug)]
pub struct StreamProcessorConfig {
  /// Longest wait for a new event before the loop re-checks its
  /// surroundings (cancellation, admin commands, due retries).
  pub event_wait: Duration,
  /// Backoff after a transient fetch failure.
  pub fetch_backoff: Duration,
}

impl StreamProcessorConfig {
  /// Sets the bounded wait for new events.
  pub fn with_event_wait(mut self, event_wait: Duration) -> Self {
    self.event_wait = event_wait;
    self
  }

  /// Sets the backoff after transient fetch failures.
  pub fn with_fetch_backoff(mut self, fetch_backoff: Duration) -> Self {
    self.fetch_backoff = fetch_backoff;
    self
  }

  /// Rejects configurations that would make a loop spin.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.event_wait.is_zero() {
      return Err(ConfigError::ZeroWait("event_wait"));
    }
    if self.fetch_backoff.is_zero() {
      return Err(ConfigError::ZeroWait("fetch_backoff"));
    }
    Ok(())
  }
}

impl Default for StreamProcessorConfig {
  fn default() -> Self {
    Self {
      event_wait: Duration::from_secs(60),
      fetch_backoff: Duration::from_secs(1),
    }
  }
}

pub(crate) enum AdminCommand {
  ResetToPosition {
    position: ProcessingPosition,
    reply: oneshot::Sender<Result<(), ResetError>>,
  },
}

/// Observer and administrative surface of one stream processor.
///
/// Handles stay valid for the lifetime of the processor task and are cheap to
/// clone. The state they see is the in-memory state published after every
/// persisted transition.
#[derive(Clone)]
pub struct ProcessorHandle {
  state: watch::Receiver<StreamProcessorState>,
  commands: mpsc::Sender<AdminCommand>,
}

impl ProcessorHandle {
  pub(crate) fn new(
    state: watch::Receiver<StreamProcessorState>,
    commands: mpsc::Sender<AdminCommand>,
  ) -> Self {
    Self { state, commands }
  }

  /// Snapshot of the current in-memory state.
  pub fn state(&self) -> StreamProcessorState {
    self.state.borrow().clone()
  }

  /// Channel of state snapshots, updated after every persisted transition.
  pub fn watch(&self) -> watch::Receiver<StreamProcessorState> {
    self.state.clone()
  }

  /// Rewinds the processor to `position` and clears failing bookkeeping at or
  /// after it, so the loop re-reads from there. Rejects positions ahead of
  /// the current one, and drivers whose feed cannot re-read earlier events;
  /// resetting to the current position retries a pinned failure immediately.
  ///
  /// The command is picked up at the top of the next loop iteration, at the
  /// latest after one bounded wait.
  pub async fn reset_to_position(&self, position: ProcessingPosition) -> Result<(), ResetError> {
    let (reply, confirmed) = oneshot::channel();
    self
      .commands
      .send(AdminCommand::ResetToPosition { position, reply })
      .await
      .map_err(|_| ResetError::NotRunning)?;
    confirmed.await.map_err(|_| ResetError::NotRunning)?
  }
}

/// Whether the host has requested shutdown (or dropped its end entirely).
pub(crate) fn is_cancelled(shutdown: &mut watch::Receiver<bool>) -> bool {
  shutdown.has_changed().is_err() || *shutdown.borrow()
}

/// Sleeps for `wait` unless shutdown arrives first. Returns whether shutdown
/// was requested.
pub(crate) async fn sleep_cancellable(
  shutdown: &mut watch::Receiver<bool>,
  wait: Duration,
) -> bool {
  if wait.is_zero() {
    return is_cancelled(shutdown);
  }
  tokio::select! {
    _ = tokio::time::sleep(wait) => is_cancelled(shutdown),
    changed = shutdown.changed() => match changed {
      Ok(()) => *shutdown.borrow(),
      Err(_) => true,
    },
  }
}
