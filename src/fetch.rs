//! Event log collaborators: fetching, waiting, and a reference in-memory log.
//!
//! The engine consumes the log through two narrow traits. [`EventFetcher`]
//! reads the next event at or after a position, either over the whole stream
//! or scoped to one partition (the catch-up pass needs the latter).
//! [`EventWaiter`] parks the caller until a new event may be available, so the
//! run loops never busy-poll. [`InMemoryEventLog`] implements both over an
//! append-only vector and adds a live subscription feed for the push driver;
//! it is a reference implementation and test double, not a storage engine.

use crate::event::StreamEvent;
use crate::identity::PartitionId;
use crate::position::{EventLogPosition, ProcessingPosition, StreamPosition};
use chrono::Utc;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Error type for event fetch operations.
#[derive(Error, Debug)]
pub enum FetchError {
  /// Reading from the event log failed. Transient: the engine waits and
  /// retries the fetch.
  #[error("event log read failed: {0}")]
  Read(String),
  /// The feed is closed and can produce no further events.
  #[error("event feed closed")]
  Closed,
}

/// Trait for reading events from a stream.
#[async_trait::async_trait]
pub trait EventFetcher: Send + Sync {
  /// Next event at or after `position`, or `Ok(None)` when the stream has no
  /// such event yet.
  async fn fetch_next(&self, position: StreamPosition)
  -> Result<Option<StreamEvent>, FetchError>;

  /// Next event of `partition` at or after `position`, or `Ok(None)` when the
  /// partition has no such event yet.
  async fn fetch_in_partition(
    &self,
    partition: &PartitionId,
    position: StreamPosition,
  ) -> Result<Option<StreamEvent>, FetchError>;
}

/// Trait for waiting until a stream may have grown.
///
/// A waiter instance is already scoped to the stream its processor reads.
#[async_trait::async_trait]
pub trait EventWaiter: Send + Sync {
  /// Resolves once an event at or after `position` exists, or after
  /// `max_wait`, whichever comes first. Spurious early returns are fine; the
  /// caller re-fetches either way.
  async fn wait_for_event(&self, position: StreamPosition, max_wait: Duration);
}

struct LogInner {
  events: tokio::sync::Mutex<Vec<StreamEvent>>,
  head: watch::Sender<u64>,
}

/// Append-only in-memory event log.
///
/// Positions are dense: the n-th appended event sits at stream position n and
/// event log position n. Clones share the same log.
#[derive(Clone)]
pub struct InMemoryEventLog {
  inner: Arc<LogInner>,
}

impl Default for InMemoryEventLog {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryEventLog {
  /// Creates an empty log.
  pub fn new() -> Self {
    let (head, _) = watch::channel(0);
    Self {
      inner: Arc::new(LogInner {
        events: tokio::sync::Mutex::new(Vec::new()),
        head,
      }),
    }
  }

  /// Appends an event, assigning it the next position, and returns the stored
  /// envelope.
  pub async fn append(
    &self,
    partition: impl Into<PartitionId>,
    event_type: impl Into<String>,
    payload: serde_json::Value,
  ) -> StreamEvent {
    let mut events = self.inner.events.lock().await;
    let next = events.len() as u64;
    let event = StreamEvent::new(
      ProcessingPosition::new(StreamPosition::new(next), EventLogPosition::new(next)),
      partition.into(),
      event_type,
      Utc::now(),
      payload,
    );
    events.push(event.clone());
    self.inner.head.send_replace(events.len() as u64);
    event
  }

  /// Position the next appended event will get.
  pub fn head(&self) -> StreamPosition {
    StreamPosition::new(*self.inner.head.borrow())
  }

  /// Live feed of every event at or after `from`, in order: first the events
  /// already in the log, then new ones as they are appended. The stream never
  /// ends while the log exists.
  pub fn subscribe(&self, from: StreamPosition) -> BoxStream<'static, StreamEvent> {
    let inner = self.inner.clone();
    Box::pin(async_stream::stream! {
      let mut next = from.value();
      let mut head = inner.head.subscribe();
      loop {
        if head.wait_for(|h| *h > next).await.is_err() {
          break;
        }
        let event = { inner.events.lock().await.get(next as usize).cloned() };
        if let Some(event) = event {
          next += 1;
          yield event;
        }
      }
    })
  }
}

#[async_trait::async_trait]
impl EventFetcher for InMemoryEventLog {
  async fn fetch_next(
    &self,
    position: StreamPosition,
  ) -> Result<Option<StreamEvent>, FetchError> {
    let events = self.inner.events.lock().await;
    Ok(events.get(position.value() as usize).cloned())
  }

  async fn fetch_in_partition(
    &self,
    partition: &PartitionId,
    position: StreamPosition,
  ) -> Result<Option<StreamEvent>, FetchError> {
    let events = self.inner.events.lock().await;
    Ok(
      events
        .iter()
        .skip(position.value() as usize)
        .find(|event| event.partition == *partition)
        .cloned(),
    )
  }
}

#[async_trait::async_trait]
impl EventWaiter for InMemoryEventLog {
  async fn wait_for_event(&self, position: StreamPosition, max_wait: Duration) {
    let mut head = self.inner.head.subscribe();
    let _ = tokio::time::timeout(max_wait, head.wait_for(|h| *h > position.value())).await;
  }
}
