//! Errors that stop a stream processor task.
//!
//! Per-event failures never appear here: they are captured into the failing
//! bookkeeping of [`crate::state`] and drive the retry machinery. A run loop
//! returns one of these errors only to crash-stop, leaving recovery to a
//! restart plus checkpoint reload.

use crate::identity::{PartitionId, StreamProcessorId};
use crate::position::ProcessingPosition;
use crate::store::CheckpointError;
use thiserror::Error;

/// Fatal error of a running stream processor.
#[derive(Debug, Error)]
pub enum StreamProcessorError {
  /// The processor was started with an invalid configuration.
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),

  /// The checkpoint store failed while loading or persisting.
  #[error("checkpoint store failure: {0}")]
  Store(#[from] CheckpointError),

  /// A partition-scoped fetch returned an event of a different partition.
  /// Signals a bug in the fetcher or corrupted state.
  #[error("catch-up for partition {expected} fetched an event of partition {actual} at {position}")]
  PartitionMismatch {
    /// Partition the catch-up pass asked for.
    expected: PartitionId,
    /// Partition of the event that came back.
    actual: PartitionId,
    /// Position of the mismatched event.
    position: ProcessingPosition,
  },

  /// The persisted state has the wrong shape for this processor.
  #[error("persisted state for {id} is {actual}, expected {expected}")]
  StateShape {
    /// Processor whose checkpoint was loaded.
    id: StreamProcessorId,
    /// Shape this processor requires.
    expected: &'static str,
    /// Shape found in the store.
    actual: &'static str,
  },

  /// The event feed closed and can produce no further events.
  #[error("event feed closed for {id}")]
  DriverClosed {
    /// Processor whose feed closed.
    id: StreamProcessorId,
  },
}

/// Invalid stream processor configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
  /// A wait that bounds a loop iteration was zero and would make it spin.
  #[error("{0} must be greater than zero")]
  ZeroWait(&'static str),
}

/// Why an administrative reset was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResetError {
  /// Resets only rewind; skipping unread events forward is not allowed.
  #[error("cannot reset forward: requested {requested} is ahead of current {current}")]
  AheadOfCurrent {
    /// Position the reset asked for.
    requested: ProcessingPosition,
    /// Position the processor currently holds.
    current: ProcessingPosition,
  },

  /// The processor's event feed cannot re-read earlier events, so rewinding
  /// the checkpoint would silently skip the rewound range.
  #[error("the event feed cannot rewind to an earlier position")]
  CannotRewind,

  /// The processor task has stopped; there is nothing to reset.
  #[error("stream processor is not running")]
  NotRunning,
}
