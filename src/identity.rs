//! Identities for stream processors and the streams they consume.
//!
//! All of these are opaque newtypes: the engine only ever compares them,
//! formats them for logs, and uses them as map keys. The composite
//! [`StreamProcessorId`] is the checkpoint store key; two processors with the
//! same id must never run concurrently against the same store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope a processor runs in (e.g. the default scope or a named projection
/// scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
  /// The default scope.
  pub fn default_scope() -> Self {
    ScopeId("default".to_string())
  }

  /// Returns the scope as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for ScopeId {
  fn from(value: &str) -> Self {
    ScopeId(value.to_string())
  }
}

impl fmt::Display for ScopeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identity of the consumer an event is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventProcessorId(pub String);

impl EventProcessorId {
  /// Returns the identity as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for EventProcessorId {
  fn from(value: &str) -> Self {
    EventProcessorId(value.to_string())
  }
}

impl fmt::Display for EventProcessorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identity of the source stream a processor reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
  /// Returns the identity as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for StreamId {
  fn from(value: &str) -> Self {
    StreamId(value.to_string())
  }
}

impl fmt::Display for StreamId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Partition key derived from an event, typically its event-source
/// identifier.
///
/// Partitions isolate ordering and failure within one stream: events sharing
/// a `PartitionId` are processed in position order, events of different
/// partitions are independent. Ordered so failing-partition maps iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub String);

impl PartitionId {
  /// Returns the key as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for PartitionId {
  fn from(value: String) -> Self {
    PartitionId(value)
  }
}

impl From<&str> for PartitionId {
  fn from(value: &str) -> Self {
    PartitionId(value.to_string())
  }
}

impl fmt::Display for PartitionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Checkpoint key of one stream processor: which consumer reads which stream
/// in which scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProcessorId {
  /// Scope the processor runs in.
  pub scope: ScopeId,
  /// Consumer the events are dispatched to.
  pub event_processor: EventProcessorId,
  /// Stream the processor reads.
  pub source_stream: StreamId,
}

impl StreamProcessorId {
  /// Creates a stream processor id.
  pub fn new(scope: ScopeId, event_processor: EventProcessorId, source_stream: StreamId) -> Self {
    StreamProcessorId {
      scope,
      event_processor,
      source_stream,
    }
  }
}

impl fmt::Display for StreamProcessorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}/{}",
      self.scope, self.event_processor, self.source_stream
    )
  }
}
