//! Event drivers: where a run loop's next event comes from.
//!
//! A [`PullDriver`] fetches on demand and waits when the stream is drained; a
//! [`PushDriver`] consumes a subscription feed and acknowledges each event
//! once its transition is persisted. The engines only see [`EventDriver`], so
//! both shapes produce identical state transitions.

use crate::event::StreamEvent;
use crate::fetch::{EventFetcher, EventWaiter, FetchError};
use crate::position::{ProcessingPosition, StreamPosition};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Trait for the source of a run loop's events.
#[async_trait::async_trait]
pub trait EventDriver: Send {
  /// Next event at or after `position`, or `Ok(None)` if none arrived
  /// within `max_wait`.
  async fn next(
    &mut self,
    position: StreamPosition,
    max_wait: Duration,
  ) -> Result<Option<StreamEvent>, FetchError>;

  /// Notification that a transition was persisted and the loop's read cursor
  /// now stands at `position`. The cursor does not advance past a failed
  /// event, so a driver must keep such an event available for redelivery.
  /// Defaults to doing nothing.
  async fn ack(&mut self, position: ProcessingPosition) {
    let _ = position;
  }

  /// Repositions the driver so its next delivery starts at `position` again,
  /// returning whether it could. An administrative reset is rejected when the
  /// driver cannot re-read earlier events. Drivers that read from the asked
  /// position on every call need no repositioning; the default reports
  /// success.
  async fn rewind(&mut self, position: StreamPosition) -> bool {
    let _ = position;
    true
  }
}

/// Driver that polls an [`EventFetcher`] and parks on an [`EventWaiter`]
/// while the stream is drained.
pub struct PullDriver<F, W> {
  fetcher: Arc<F>,
  waiter: Arc<W>,
}

impl<F, W> PullDriver<F, W> {
  /// Creates a pull driver over a fetcher and a waiter.
  pub fn new(fetcher: Arc<F>, waiter: Arc<W>) -> Self {
    Self { fetcher, waiter }
  }
}

#[async_trait::async_trait]
impl<F, W> EventDriver for PullDriver<F, W>
where
  F: EventFetcher,
  W: EventWaiter,
{
  async fn next(
    &mut self,
    position: StreamPosition,
    max_wait: Duration,
  ) -> Result<Option<StreamEvent>, FetchError> {
    if let Some(event) = self.fetcher.fetch_next(position).await? {
      return Ok(Some(event));
    }
    self.waiter.wait_for_event(position, max_wait).await;
    self.fetcher.fetch_next(position).await
  }
}

type Resubscribe = Box<dyn FnMut(StreamPosition) -> BoxStream<'static, StreamEvent> + Send>;

/// Driver fed by a subscription stream.
///
/// The last delivered event stays pending until an acknowledged cursor moves
/// past it, so a failed event can be redelivered even though the feed has
/// moved on. Redeliveries below the asked position are skipped; a closed feed
/// surfaces as [`FetchError::Closed`] so the engine can stop instead of
/// spinning on an endless `None`.
///
/// The feed itself cannot rewind. A driver built with
/// [`Self::with_resubscribe`] replaces the feed on rewind and so supports
/// administrative resets; without it, resets are rejected.
pub struct PushDriver {
  feed: BoxStream<'static, StreamEvent>,
  pending: Option<StreamEvent>,
  acks: Option<mpsc::UnboundedSender<ProcessingPosition>>,
  resubscribe: Option<Resubscribe>,
}

impl PushDriver {
  /// Creates a push driver over a subscription feed.
  pub fn new(feed: BoxStream<'static, StreamEvent>) -> Self {
    Self {
      feed,
      pending: None,
      acks: None,
      resubscribe: None,
    }
  }

  /// Forwards the acknowledged read cursor to `acks` after each persisted
  /// transition.
  pub fn with_acks(mut self, acks: mpsc::UnboundedSender<ProcessingPosition>) -> Self {
    self.acks = Some(acks);
    self
  }

  /// Obtains a fresh feed from `resubscribe` whenever the driver must rewind.
  pub fn with_resubscribe<F>(mut self, resubscribe: F) -> Self
  where
    F: FnMut(StreamPosition) -> BoxStream<'static, StreamEvent> + Send + 'static,
  {
    self.resubscribe = Some(Box::new(resubscribe));
    self
  }
}

#[async_trait::async_trait]
impl EventDriver for PushDriver {
  async fn next(
    &mut self,
    position: StreamPosition,
    max_wait: Duration,
  ) -> Result<Option<StreamEvent>, FetchError> {
    match self.pending.take() {
      Some(pending) if pending.position.stream_position >= position => {
        self.pending = Some(pending.clone());
        return Ok(Some(pending));
      }
      _ => {}
    }
    let deadline = Instant::now() + max_wait;
    loop {
      let remaining = deadline.duration_since(Instant::now());
      let event = match tokio::time::timeout(remaining, self.feed.next()).await {
        Err(_) => return Ok(None),
        Ok(None) => return Err(FetchError::Closed),
        Ok(Some(event)) => event,
      };
      if event.position.stream_position < position {
        continue;
      }
      self.pending = Some(event.clone());
      return Ok(Some(event));
    }
  }

  async fn ack(&mut self, position: ProcessingPosition) {
    if let Some(pending) = &self.pending {
      if pending.position.stream_position < position.stream_position {
        self.pending = None;
      }
    }
    if let Some(acks) = &self.acks {
      let _ = acks.send(position);
    }
  }

  async fn rewind(&mut self, position: StreamPosition) -> bool {
    let Some(resubscribe) = self.resubscribe.as_mut() else {
      return false;
    };
    self.feed = resubscribe(position);
    self.pending = None;
    true
  }
}
