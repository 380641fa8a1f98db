//! Position model: where a stream processor stands in its stream and in the
//! global event log.
//!
//! A processor tracks two coordinates at once. `StreamPosition` indexes the
//! filtered/partitioned view the processor reads; `EventLogPosition` indexes
//! the same event in the append-only log every stream is derived from. They
//! advance together, one step per consumed event, and a persisted checkpoint
//! always carries both for the same event boundary (the next event to
//! consume).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Zero-based index into the stream a processor reads.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StreamPosition(pub u64);

impl StreamPosition {
  /// Creates a stream position.
  pub const fn new(value: u64) -> Self {
    StreamPosition(value)
  }

  /// Returns the raw counter value.
  pub const fn value(&self) -> u64 {
    self.0
  }

  /// Position of the event after this one.
  pub const fn next(&self) -> Self {
    StreamPosition(self.0 + 1)
  }
}

impl fmt::Display for StreamPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Sequence number of an event in the global append-only event log.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EventLogPosition(pub u64);

impl EventLogPosition {
  /// Creates an event log position.
  pub const fn new(value: u64) -> Self {
    EventLogPosition(value)
  }

  /// Returns the raw sequence number.
  pub const fn value(&self) -> u64 {
    self.0
  }

  /// Sequence number after this one.
  pub const fn next(&self) -> Self {
    EventLogPosition(self.0 + 1)
  }
}

impl fmt::Display for EventLogPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A checkpoint unit: the stream and event-log coordinates of the next event
/// to consume.
///
/// Ordering is by stream position first. The two coordinates move in lockstep,
/// so for positions of the same stream the orderings agree.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProcessingPosition {
  /// Position in the stream the processor reads.
  pub stream_position: StreamPosition,
  /// Position of the same event boundary in the event log.
  pub event_log_position: EventLogPosition,
}

impl ProcessingPosition {
  /// Creates a processing position from both coordinates.
  pub const fn new(stream_position: StreamPosition, event_log_position: EventLogPosition) -> Self {
    ProcessingPosition {
      stream_position,
      event_log_position,
    }
  }

  /// The position a brand-new processor starts from.
  pub const fn initial() -> Self {
    ProcessingPosition {
      stream_position: StreamPosition(0),
      event_log_position: EventLogPosition(0),
    }
  }

  /// The position after consuming the event at this position. Both
  /// coordinates advance by one.
  pub const fn next(&self) -> Self {
    ProcessingPosition {
      stream_position: self.stream_position.next(),
      event_log_position: self.event_log_position.next(),
    }
  }
}

impl fmt::Display for ProcessingPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.stream_position, self.event_log_position)
  }
}
