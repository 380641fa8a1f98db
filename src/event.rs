//! The event envelope a stream processor consumes.

use crate::identity::PartitionId;
use crate::position::ProcessingPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event read from a stream, decorated with the coordinates and partition
/// key the engine needs. The payload itself is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
  /// Position of this event in the stream and the event log.
  pub position: ProcessingPosition,
  /// Partition the event belongs to. Unpartitioned processors ignore it.
  pub partition: PartitionId,
  /// Type label of the event.
  pub event_type: String,
  /// When the event occurred.
  pub occurred: DateTime<Utc>,
  /// Payload as committed to the event log.
  pub payload: serde_json::Value,
}

impl StreamEvent {
  /// Creates an event envelope.
  pub fn new(
    position: ProcessingPosition,
    partition: PartitionId,
    event_type: impl Into<String>,
    occurred: DateTime<Utc>,
    payload: serde_json::Value,
  ) -> Self {
    StreamEvent {
      position,
      partition,
      event_type: event_type.into(),
      occurred,
      payload,
    }
  }

  /// The position a processor holds after consuming this event.
  pub fn next_processing_position(&self) -> ProcessingPosition {
    self.position.next()
  }
}
