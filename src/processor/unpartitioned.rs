//! Strictly ordered consumption of an unpartitioned stream.

use super::{
  is_cancelled, sleep_cancellable, AdminCommand, EventDriver, EventProcessor, ProcessorHandle,
  StreamProcessorConfig,
};
use crate::error::{ResetError, StreamProcessorError};
use crate::event::StreamEvent;
use crate::fetch::FetchError;
use crate::identity::StreamProcessorId;
use crate::policy::RetryTimePolicy;
use crate::result::ProcessingResult;
use crate::state::{StreamProcessorState, UnpartitionedState};
use crate::store::CheckpointStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Engine for streams whose events form a single totally ordered sequence.
///
/// The loop never moves past a failed event: a failure pins the position,
/// records the reason and schedules a retry, and the stream stalls until the
/// retry succeeds or the failure is resolved administratively. Every
/// transition is persisted before the loop continues, so a crash at any point
/// resumes at the exact event the checkpoint names.
pub struct UnpartitionedProcessor<P, D, S, R> {
  id: StreamProcessorId,
  processor: Arc<P>,
  driver: D,
  store: Arc<S>,
  policy: R,
  config: StreamProcessorConfig,
  state_tx: watch::Sender<StreamProcessorState>,
  commands_tx: mpsc::Sender<AdminCommand>,
  commands_rx: mpsc::Receiver<AdminCommand>,
}

impl<P, D, S, R> UnpartitionedProcessor<P, D, S, R>
where
  P: EventProcessor,
  D: EventDriver,
  S: CheckpointStore,
  R: RetryTimePolicy,
{
  /// Creates an engine over its collaborators. Nothing runs until
  /// [`Self::run`] is awaited.
  pub fn new(
    id: StreamProcessorId,
    processor: Arc<P>,
    driver: D,
    store: Arc<S>,
    policy: R,
    config: StreamProcessorConfig,
  ) -> Self {
    let (state_tx, _) = watch::channel(UnpartitionedState::initial().into());
    let (commands_tx, commands_rx) = mpsc::channel(8);
    Self {
      id,
      processor,
      driver,
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
      None => UnpartitionedState::initial(),
      Some(StreamProcessorState::Unpartitioned(state)) => state,
      Some(StreamProcessorState::Partitioned(_)) => {
        error!(stream_processor = %self.id, "persisted state has the wrong shape, stopping");
        return Err(StreamProcessorError::StateShape {
          id: self.id.clone(),
          expected: "unpartitioned",
          actual: "partitioned",
        });
      }
    };
    self.state_tx.send_replace(state.clone().into());
    info!(stream_processor = %self.id, position = %state.position, "stream processor started");

    loop {
      if is_cancelled(&mut shutdown) {
        break;
      }
      state = self.drain_admin(state).await?;

      let now = Utc::now();
      if state.is_failing && !state.retry_due(now) {
        let wait = self.policy.for_processor(&state, now);
        trace!(stream_processor = %self.id, ?wait, "retry not due yet");
        if sleep_cancellable(&mut shutdown, wait).await {
          break;
        }
        continue;
      }

      let fetched = tokio::select! {
        fetched = self.driver.next(state.position.stream_position, self.config.event_wait) => fetched,
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

      let result = tokio::select! {
        result = Self::invoke(&self.processor, &state, &event) => result,
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
            position = %state.position,
            attempts = next_state.processing_attempts,
            retry,
            reason,
            "event processing failed"
          );
        }
      }
      Self::persist_and_publish(&self.id, &self.store, &self.state_tx, &next_state).await?;
      self.driver.ack(next_state.position).await;
      state = next_state;
    }

    info!(stream_processor = %self.id, position = %state.position, "stream processor stopped");
    Ok(())
  }

  /// First attempts go to `process`; a pinned failing position goes to
  /// `process_retry` with the stored reason and how many retries preceded
  /// this one.
  async fn invoke(
    processor: &Arc<P>,
    state: &UnpartitionedState,
    event: &StreamEvent,
  ) -> ProcessingResult {
    if state.is_failing {
      let reason = state.failure_reason.as_deref().unwrap_or("");
      processor
        .process_retry(event, reason, state.processing_attempts.saturating_sub(1))
        .await
    } else {
      processor.process(event).await
    }
  }

  async fn drain_admin(
    &mut self,
    state: UnpartitionedState,
  ) -> Result<UnpartitionedState, StreamProcessorError> {
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
    state: &UnpartitionedState,
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
