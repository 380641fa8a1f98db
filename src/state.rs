//! Checkpoint state for stream processors, and the transitions that interpret
//! processing results.
//!
//! States are plain values: every transition takes the current state by
//! reference and returns the next one, so the live processor, the store and
//! any observer always hold comparable snapshots rather than aliases of a
//! shared mutable object. The run loops persist the returned value before
//! acting on it further, which is what makes checkpointing crash-consistent.

use crate::event::StreamEvent;
use crate::identity::PartitionId;
use crate::position::ProcessingPosition;
use crate::result::ProcessingResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry time of a failure that must wait for operator intervention.
pub const RETRY_NEVER: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

fn retry_time_for(retry: bool, retry_timeout: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
  if !retry {
    return RETRY_NEVER;
  }
  chrono::Duration::from_std(retry_timeout)
    .ok()
    .and_then(|timeout| now.checked_add_signed(timeout))
    .unwrap_or(RETRY_NEVER)
}

/// State of an unpartitioned stream processor.
///
/// Created at position zero on the first run and mutated on every attempt;
/// never deleted. While `is_failing` is set the position does not advance and
/// the same event is retried once `retry_time` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpartitionedState {
  /// Next event to consume.
  pub position: ProcessingPosition,
  /// Whether the event at `position` has failed and is awaiting a retry.
  pub is_failing: bool,
  /// Attempts made at the current position.
  pub processing_attempts: u32,
  /// When the next retry is due. [`RETRY_NEVER`] for fatal failures.
  pub retry_time: DateTime<Utc>,
  /// Reason of the last failure, replayed to the processor on retry.
  pub failure_reason: Option<String>,
  /// When an event was last processed successfully.
  pub last_successfully_processed: DateTime<Utc>,
}

impl UnpartitionedState {
  /// State of a processor that has never run.
  pub fn initial() -> Self {
    Self::initial_at(ProcessingPosition::initial())
  }

  /// Non-failing state starting at `position`.
  pub fn initial_at(position: ProcessingPosition) -> Self {
    UnpartitionedState {
      position,
      is_failing: false,
      processing_attempts: 0,
      retry_time: DateTime::UNIX_EPOCH,
      failure_reason: None,
      last_successfully_processed: DateTime::UNIX_EPOCH,
    }
  }

  /// Whether the retry for the failing position is due at `now`.
  pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
    now >= self.retry_time
  }

  /// Interprets the result of processing `event` and returns the next state.
  ///
  /// Success advances past the event and clears the failing bookkeeping. Any
  /// failure keeps the position (the same event will be retried), increments
  /// the attempt count and schedules the retry; a non-retryable failure pins
  /// the retry time to [`RETRY_NEVER`].
  pub fn apply(&self, result: &ProcessingResult, event: &StreamEvent, now: DateTime<Utc>) -> Self {
    match result {
      ProcessingResult::Successful => UnpartitionedState {
        position: event.next_processing_position(),
        is_failing: false,
        processing_attempts: 0,
        retry_time: DateTime::UNIX_EPOCH,
        failure_reason: None,
        last_successfully_processed: now,
      },
      ProcessingResult::Failed {
        reason,
        retry,
        retry_timeout,
      } => UnpartitionedState {
        position: self.position,
        is_failing: true,
        processing_attempts: self.processing_attempts + 1,
        retry_time: retry_time_for(*retry, *retry_timeout, now),
        failure_reason: Some(reason.clone()),
        last_successfully_processed: self.last_successfully_processed,
      },
    }
  }

  /// Administrative rewind to `position`: clears the failing bookkeeping and
  /// lets the loop re-read from there.
  pub fn reset_to(&self, position: ProcessingPosition) -> Self {
    UnpartitionedState {
      position,
      is_failing: false,
      processing_attempts: 0,
      retry_time: DateTime::UNIX_EPOCH,
      failure_reason: None,
      last_successfully_processed: self.last_successfully_processed,
    }
  }
}

/// Failure record of one partition of a partitioned stream processor.
///
/// `position` is the partition's own resume point and never runs ahead of the
/// processor's read cursor. A failed retry keeps `position` where it is, so
/// the unresolved event is always the first thing a partition-scoped fetch at
/// `position` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingPartitionState {
  /// Next event of this partition to retry.
  pub position: ProcessingPosition,
  /// When the next retry is due. [`RETRY_NEVER`] for fatal failures.
  pub retry_time: DateTime<Utc>,
  /// Reason of the last failure, replayed to the processor on retry.
  pub reason: String,
  /// Attempts made at the current resume position.
  pub processing_attempts: u32,
  /// When this partition last failed.
  pub last_failed: DateTime<Utc>,
}

impl FailingPartitionState {
  /// Record for a partition whose event just failed for the first time.
  pub fn new_failure(
    position: ProcessingPosition,
    reason: impl Into<String>,
    retry: bool,
    retry_timeout: Duration,
    now: DateTime<Utc>,
  ) -> Self {
    FailingPartitionState {
      position,
      retry_time: retry_time_for(retry, retry_timeout, now),
      reason: reason.into(),
      processing_attempts: 1,
      last_failed: now,
    }
  }

  /// Whether the retry for this partition is due at `now`.
  pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
    now >= self.retry_time
  }

  /// Record after a successful retry of the event at the resume point: the
  /// resume point moves to `next_position` and the attempt count starts over.
  pub fn after_successful_retry(
    &self,
    next_position: ProcessingPosition,
    now: DateTime<Utc>,
  ) -> Self {
    FailingPartitionState {
      position: next_position,
      retry_time: now,
      reason: self.reason.clone(),
      processing_attempts: 0,
      last_failed: self.last_failed,
    }
  }

  /// Record after a failed retry: same resume position, bumped attempt count,
  /// new retry time (pinned to [`RETRY_NEVER`] when not retryable).
  pub fn after_failed_retry(
    &self,
    reason: impl Into<String>,
    retry: bool,
    retry_timeout: Duration,
    now: DateTime<Utc>,
  ) -> Self {
    FailingPartitionState {
      position: self.position,
      retry_time: retry_time_for(retry, retry_timeout, now),
      reason: reason.into(),
      processing_attempts: self.processing_attempts + 1,
      last_failed: now,
    }
  }
}

/// State of a partitioned stream processor.
///
/// `position` is the read cursor over the whole stream and advances past
/// events of failing partitions (they are caught up separately), so one bad
/// partition never starves the others. Each failing partition keeps its own
/// resume point in `failing_partitions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedState {
  /// Next event to read from the stream.
  pub position: ProcessingPosition,
  /// Resume point and retry bookkeeping per failing partition.
  pub failing_partitions: BTreeMap<PartitionId, FailingPartitionState>,
  /// When an event was last processed successfully.
  pub last_successfully_processed: DateTime<Utc>,
}

impl PartitionedState {
  /// State of a processor that has never run.
  pub fn initial() -> Self {
    Self::initial_at(ProcessingPosition::initial())
  }

  /// State with no failing partitions starting at `position`.
  pub fn initial_at(position: ProcessingPosition) -> Self {
    PartitionedState {
      position,
      failing_partitions: BTreeMap::new(),
      last_successfully_processed: DateTime::UNIX_EPOCH,
    }
  }

  /// Whether `partition` currently has a failure record.
  pub fn is_partition_failing(&self, partition: &PartitionId) -> bool {
    self.failing_partitions.contains_key(partition)
  }

  /// Where a fresh subscription must start so that no failing partition has
  /// its pending events skipped: the smallest failing resume point, or the
  /// read cursor when nothing is failing.
  pub fn earliest_position(&self) -> ProcessingPosition {
    self
      .failing_partitions
      .values()
      .map(|failing| failing.position)
      .min()
      .unwrap_or(self.position)
  }

  /// State after the read cursor skipped `event` because its partition is
  /// already failing. The event is retried later by the catch-up pass.
  pub fn after_skipped_event(&self, event: &StreamEvent) -> Self {
    PartitionedState {
      position: event.next_processing_position(),
      failing_partitions: self.failing_partitions.clone(),
      last_successfully_processed: self.last_successfully_processed,
    }
  }

  /// Interprets the result of processing `event` in a healthy partition.
  ///
  /// The read cursor advances either way. A failure additionally creates the
  /// partition's failure record at the event's own position, which from then
  /// on marks the partition's resume point.
  pub fn apply(&self, result: &ProcessingResult, event: &StreamEvent, now: DateTime<Utc>) -> Self {
    match result {
      ProcessingResult::Successful => PartitionedState {
        position: event.next_processing_position(),
        failing_partitions: self.failing_partitions.clone(),
        last_successfully_processed: now,
      },
      ProcessingResult::Failed {
        reason,
        retry,
        retry_timeout,
      } => {
        let mut failing_partitions = self.failing_partitions.clone();
        failing_partitions.insert(
          event.partition.clone(),
          FailingPartitionState::new_failure(
            event.position,
            reason.clone(),
            *retry,
            *retry_timeout,
            now,
          ),
        );
        PartitionedState {
          position: event.next_processing_position(),
          failing_partitions,
          last_successfully_processed: self.last_successfully_processed,
        }
      }
    }
  }

  /// State with `partition`'s failure record replaced.
  pub fn with_failing_partition(
    &self,
    partition: &PartitionId,
    record: FailingPartitionState,
  ) -> Self {
    let mut failing_partitions = self.failing_partitions.clone();
    failing_partitions.insert(partition.clone(), record);
    PartitionedState {
      position: self.position,
      failing_partitions,
      last_successfully_processed: self.last_successfully_processed,
    }
  }

  /// State with `partition`'s failure record removed (the partition caught
  /// up).
  pub fn without_failing_partition(&self, partition: &PartitionId) -> Self {
    let mut failing_partitions = self.failing_partitions.clone();
    failing_partitions.remove(partition);
    PartitionedState {
      position: self.position,
      failing_partitions,
      last_successfully_processed: self.last_successfully_processed,
    }
  }

  /// State with a fresh `last_successfully_processed` timestamp (a catch-up
  /// retry succeeded).
  pub fn with_last_successfully_processed(&self, now: DateTime<Utc>) -> Self {
    PartitionedState {
      position: self.position,
      failing_partitions: self.failing_partitions.clone(),
      last_successfully_processed: now,
    }
  }

  /// Administrative rewind to `position`: drops failure records at or after
  /// it (their events will be re-read by the cursor) and keeps earlier ones,
  /// whose resume points are still pending.
  pub fn reset_to(&self, position: ProcessingPosition) -> Self {
    let failing_partitions = self
      .failing_partitions
      .iter()
      .filter(|(_, failing)| failing.position < position)
      .map(|(partition, failing)| (partition.clone(), failing.clone()))
      .collect();
    PartitionedState {
      position,
      failing_partitions,
      last_successfully_processed: self.last_successfully_processed,
    }
  }
}

/// The persisted checkpoint of a stream processor: one of the two state
/// shapes, tagged so a store can hold either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamProcessorState {
  /// State of an unpartitioned processor.
  Unpartitioned(UnpartitionedState),
  /// State of a partitioned processor.
  Partitioned(PartitionedState),
}

impl StreamProcessorState {
  /// Read cursor of the processor, whichever shape the state has.
  pub fn position(&self) -> ProcessingPosition {
    match self {
      StreamProcessorState::Unpartitioned(state) => state.position,
      StreamProcessorState::Partitioned(state) => state.position,
    }
  }

  /// Where a fresh subscription must start. Equals [`Self::position`] for
  /// unpartitioned processors and for partitioned processors with no
  /// failures.
  pub fn earliest_position(&self) -> ProcessingPosition {
    match self {
      StreamProcessorState::Unpartitioned(state) => state.position,
      StreamProcessorState::Partitioned(state) => state.earliest_position(),
    }
  }
}

impl From<UnpartitionedState> for StreamProcessorState {
  fn from(state: UnpartitionedState) -> Self {
    StreamProcessorState::Unpartitioned(state)
  }
}

impl From<PartitionedState> for StreamProcessorState {
  fn from(state: PartitionedState) -> Self {
    StreamProcessorState::Partitioned(state)
  }
}
