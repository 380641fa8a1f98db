//! Partitioned consumption: the cursor keeps moving, failing partitions
//! catch up on the side.

use super::{
  is_cancelled, sleep_cancellable, AdminCommand, EventDriver, EventProcessor, ProcessorHandle,
  StreamProcessorConfig,
};
use crate::error::{ResetError, StreamProcessorError};
use crate::fetch::{EventFetcher, FetchError};
use crate::identity::{PartitionId, StreamProcessorId};
use crate::policy::RetryTimePolicy;
use crate::result::ProcessingResult;
use crate::state::{PartitionedState, StreamProcessorState};
use crate::store::CheckpointStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Engine for streams whose events carry a partition, ordered only within
/// each partition.
///
/// A failure does not stall the stream: the failing partition gets a resume
/// record and the read cursor moves on, skipping that partition's later
/// events. Separate catch-up passes replay each failing partition from its
/// resume record, in order, until it rejoins the main flow. Events of healthy
/// partitions are never delayed by a failing one.
pub struct PartitionedProcessor<P, D, F, S, R> {
  id: StreamProcessorId,
  processor: Arc<P>,
  driver: D,
  fetcher: Arc<F>,
  store: Arc<S>,
  policy: R,
  config: StreamProcessorConfig,
  state_tx: watch::Sender<StreamProcessorState>,
  commands_tx: mpsc::Sender<AdminCommand>,
  commands_rx: mpsc::Receiver<AdminCommand>,
}

impl<P, D, F, S, R> PartitionedProcessor<P, D, F, S, R>
where
  P: EventProcessor,
  D: EventDriver,
  F: EventFetcher,
  S: CheckpointStore,
  R: RetryTimePolicy,
{
  /// Creates an engine over its collaborators. The partition-scoped
  /// `fetcher` serves catch-up reads; the driver serves the main loop.
  pub fn new(
    id: StreamProcessorId,
    processor: Arc<P>,
    driver: D,
    fetcher: Arc<F>,
    store: Arc<S>,
    policy: R,
    config: StreamProcessorConfig,
  ) -> Self {
    let (state_tx, _) = watch::channel(PartitionedState::initial().into());
    let (commands_tx, commands_rx) = mpsc::channel(8);
    Self {
      id,
      processor,
      driver,
      fetcher,
      store,
      policy,
      config,
      state_tx,
      commands_tx,
      commands_rx,
    }
  }

  /// Handle for observing state and issuing administrative commands.
  pub fn handle(&self) -> ProcessorHandle {
    ProcessorHandle::new(self.state_tx.subscribe(), self.commands_tx.clone())
  }

  /// Runs the processing loop until `shutdown` flips to `true` (or its sender
  /// is dropped), which ends the loop cleanly with `Ok(())`. An error return
  /// is a crash-stop: the persisted checkpoint is the recovery point.
  pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamProcessorError> {
    self.config.validate()?;
    let loaded = match self.store.load(&self.id).await {
      Ok(loaded) => loaded,
      Err(error) => {
        error!(stream_processor = %self.id, %error, "checkpoint load failed, stopping");
        return Err(error.into());
      }
    };
    let mut state = match loaded {
      None => PartitionedState::initial(),
      Some(StreamProcessorState::Partitioned(state)) => state,
      Some(StreamProcessorState::Unpartitioned(_)) => {
        error!(stream_processor = %self.id, "persisted state has the wrong shape, stopping");
        return Err(StreamProcessorError::StateShape {
          id: self.id.clone(),
          expected: "partitioned",
          actual: "unpartitioned",
        });
      }
    };
    self.state_tx.send_replace(state.clone().into());
    info!(
      stream_processor = %self.id,
      position = %state.position,
      failing_partitions = state.failing_partitions.len(),
      "stream processor started"
    );
    state = self.catch_up(state, &mut shutdown).await?;

    loop {
      if is_cancelled(&mut shutdown) {
        break;
      }
      state = self.drain_admin(state).await?;
      if !state.failing_partitions.is_empty() {
        state = self.catch_up(state, &mut shutdown).await?;
        if is_cancelled(&mut shutdown) {
          break;
        }
      }

      let max_wait = self.bounded_event_wait(&state, Utc::now());
      let fetched = tokio::select! {
        fetched = self.driver.next(state.position.stream_position, max_wait) => fetched,
        _ = shutdown.changed() => continue,
      };
      let event = match fetched {
        Ok(Some(event)) => event,
        Ok(None) => continue,
        Err(FetchError::Closed) => {
          error!(stream_processor = %self.id, "event feed closed, stopping");
          return Err(StreamProcessorError::DriverClosed { id: self.id.clone() });
        }
        Err(error) => {
          warn!(stream_processor = %self.id, %error, "fetch failed, backing off");
          if sleep_cancellable(&mut shutdown, self.config.fetch_backoff).await {
            break;
          }
          continue;
        }
      };

      if state.is_partition_failing(&event.partition) {
        let next_state = state.after_skipped_event(&event);
        debug!(
          stream_processor = %self.id,
          partition = %event.partition,
          position = %event.position,
          "skipped event of failing partition"
        );
        Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &next_state).await?;
        self.driver.ack(next_state.position).await;
        state = next_state;
        continue;
      }

      let result = tokio::select! {
        result = self.processor.process(&event) => result,
        _ = shutdown.changed() => {
          if is_cancelled(&mut shutdown) {
            break;
          }
          continue;
        }
      };

      let next_state = state.apply(&result, &event, Utc::now());
      match &result {
        ProcessingResult::Successful => {
          debug!(stream_processor = %self.id, position = %next_state.position, "event processed");
        }
        ProcessingResult::Failed { reason, retry, .. } => {
          warn!(
            stream_processor = %self.id,
            partition = %event.partition,
            position = %event.position,
            retry,
            reason,
            "event processing failed, partition enters catch-up"
          );
        }
      }
      Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &next_state).await?;
      self.driver.ack(next_state.position).await;
      state = next_state;
    }

    info!(
      stream_processor = %self.id,
      position = %state.position,
      failing_partitions = state.failing_partitions.len(),
      "stream processor stopped"
    );
    Ok(())
  }

  /// One catch-up pass over every failing partition.
  ///
  /// Each partition is replayed from its resume record while its retry is due
  /// and pending events below the read cursor remain, in stream order. A
  /// failed retry reschedules the partition and ends its pass immediately, so
  /// order within the partition is preserved. A partition with nothing left
  /// below the cursor has caught up and its record is removed.
  async fn catch_up(
    &mut self,
    state: PartitionedState,
    shutdown: &mut watch::Receiver<bool>,
  ) -> Result<PartitionedState, StreamProcessorError> {
    let mut state = state;
    let partitions: Vec<PartitionId> = state.failing_partitions.keys().cloned().collect();
    for partition in partitions {
      if is_cancelled(shutdown) {
        return Ok(state);
      }
      let Some(mut record) = state.failing_partitions.get(&partition).cloned() else {
        continue;
      };

      let caught_up = loop {
        if record.position >= state.position {
          break true;
        }
        if !record.retry_due(Utc::now()) {
          break false;
        }
        if is_cancelled(shutdown) {
          break false;
        }

        let fetched = match self
          .fetcher
          .fetch_in_partition(&partition, record.position.stream_position)
          .await
        {
          Ok(fetched) => fetched,
          Err(error) => {
            warn!(
              stream_processor = %self.id,
              partition = %partition,
              %error,
              "catch-up fetch failed, backing off"
            );
            sleep_cancellable(shutdown, self.config.fetch_backoff).await;
            break false;
          }
        };
        // A failed retry never advances the resume record, so an unresolved
        // event always sits at or after the record's position. Finding nothing
        // below the cursor means everything pending has succeeded.
        let Some(event) = fetched else { break true };
        if event.partition != partition {
          error!(
            stream_processor = %self.id,
            partition = %partition,
            actual = %event.partition,
            position = %event.position,
            "partition-scoped fetch returned a foreign event, stopping"
          );
          return Err(StreamProcessorError::PartitionMismatch {
            expected: partition.clone(),
            actual: event.partition.clone(),
            position: event.position,
          });
        }
        if event.position >= state.position {
          break true;
        }

        let result = tokio::select! {
          result = self.processor.process_retry(
            &event,
            &record.reason,
            record.processing_attempts.saturating_sub(1),
          ) => result,
          _ = shutdown.changed() => {
            if is_cancelled(shutdown) {
              break false;
            }
            continue;
          }
        };

        let now = Utc::now();
        match result {
          ProcessingResult::Successful => {
            record = record.after_successful_retry(event.next_processing_position(), now);
            state = state
              .with_failing_partition(&partition, record.clone())
              .with_last_successfully_processed(now);
            Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &state).await?;
            debug!(
              stream_processor = %self.id,
              partition = %partition,
              position = %record.position,
              "catch-up retry succeeded"
            );
          }
          ProcessingResult::Failed {
            reason,
            retry,
            retry_timeout,
          } => {
            record = record.after_failed_retry(reason, retry, retry_timeout, now);
            state = state.with_failing_partition(&partition, record.clone());
            Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &state).await?;
            warn!(
              stream_processor = %self.id,
              partition = %partition,
              position = %record.position,
              attempts = record.processing_attempts,
              reason = %record.reason,
              "catch-up retry failed, rescheduled"
            );
            break false;
          }
        }
      };

      if caught_up {
        state = state.without_failing_partition(&partition);
        Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &state).await?;
        info!(stream_processor = %self.id, partition = %partition, "partition caught up");
      }
    }
    Ok(state)
  }

  /// The main loop's wait for new events, shortened so it wakes for the
  /// soonest due catch-up retry.
  fn bounded_event_wait(&self, state: &PartitionedState, now: DateTime<Utc>) -> Duration {
    state
      .failing_partitions
      .values()
      .fold(self.config.event_wait, |wait, record| {
        wait.min(self.policy.for_partition(record, now))
      })
  }

  async fn drain_admin(
    &mut self,
    state: PartitionedState,
  ) -> Result<PartitionedState, StreamProcessorError> {
    let mut state = state;
    while let Ok(command) = self.commands_rx.try_recv() {
      match command {
        AdminCommand::ResetToPosition { position, reply } => {
          if position > state.position {
            let _ = reply.send(Err(ResetError::AheadOfCurrent {
              requested: position,
              current: state.position,
            }));
            continue;
          }
          if !self.driver.rewind(position.stream_position).await {
            let _ = reply.send(Err(ResetError::CannotRewind));
            continue;
          }
          let next_state = state.reset_to(position);
          Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &next_state).await?;
          info!(stream_processor = %self.id, position = %position, "reset to position");
          let _ = reply.send(Ok(()));
          state = next_state;
        }
      }
    }
    Ok(state)
  }

  // Borrows individual fields so the run future stays `Send` with a
  // `Send`-only driver.
  async fn persist_and_publish(
    id: &StreamProcessorId,
    store: &Arc<S>,
    state_tx: &watch::Sender<StreamProcessorState>,
    state: &PartitionedState,
  ) -> Result<(), StreamProcessorError> {
    let persisted: StreamProcessorState = state.clone().into();
    if let Err(error) = store.persist(id, &persisted).await {
      error!(stream_processor = %id, %error, "checkpoint persist failed, stopping");
      return Err(error.into());
    }
    state_tx.send_replace(persisted);
    Ok(())
  }
}
