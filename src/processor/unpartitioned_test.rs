use crate::error::{ResetError, StreamProcessorError};
use crate::event::StreamEvent;
use crate::fetch::{EventFetcher, FetchError, InMemoryEventLog};
use crate::identity::{PartitionId, StreamProcessorId};
use crate::policy::BoundedRetryTime;
use crate::position::{EventLogPosition, ProcessingPosition, StreamPosition};
use crate::processor::{
  EventDriver, EventProcessor, ProcessorHandle, PullDriver, PushDriver, StreamProcessorConfig,
  UnpartitionedProcessor,
};
use crate::result::ProcessingResult;
use crate::state::{PartitionedState, StreamProcessorState, UnpartitionedState, RETRY_NEVER};
use crate::store::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
use futures::StreamExt;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

fn processor_id(name: &str) -> StreamProcessorId {
  StreamProcessorId::new("default".into(), name.into(), "orders".into())
}

fn fast_config() -> StreamProcessorConfig {
  StreamProcessorConfig::default()
    .with_event_wait(Duration::from_millis(50))
    .with_fetch_backoff(Duration::from_millis(10))
}

fn position(value: u64) -> ProcessingPosition {
  ProcessingPosition::new(StreamPosition::new(value), EventLogPosition::new(value))
}

fn unpartitioned(state: &StreamProcessorState) -> &UnpartitionedState {
  match state {
    StreamProcessorState::Unpartitioned(state) => state,
    StreamProcessorState::Partitioned(_) => panic!("expected unpartitioned state"),
  }
}

async fn wait_until(
  handle: &ProcessorHandle,
  predicate: impl FnMut(&StreamProcessorState) -> bool,
) -> StreamProcessorState {
  let mut watch = handle.watch();
  let state = tokio::time::timeout(Duration::from_secs(5), watch.wait_for(predicate))
    .await
    .expect("timed out waiting for state")
    .expect("processor stopped");
  (*state).clone()
}

#[derive(Clone, Debug, PartialEq)]
struct Call {
  position: u64,
  retried: bool,
  retry_count: u32,
}

/// Processor whose outcome at each position is scripted; unscripted positions
/// succeed.
#[derive(Default)]
struct ScriptedProcessor {
  script: Mutex<HashMap<u64, VecDeque<ProcessingResult>>>,
  calls: Mutex<Vec<Call>>,
}

impl ScriptedProcessor {
  fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  async fn plan(&self, position: u64, outcomes: Vec<ProcessingResult>) {
    self.script.lock().await.insert(position, outcomes.into());
  }

  async fn calls(&self) -> Vec<Call> {
    self.calls.lock().await.clone()
  }

  async fn outcome(&self, position: u64) -> ProcessingResult {
    let mut script = self.script.lock().await;
    script
      .get_mut(&position)
      .and_then(|outcomes| outcomes.pop_front())
      .unwrap_or(ProcessingResult::Successful)
  }
}

#[async_trait::async_trait]
impl EventProcessor for ScriptedProcessor {
  async fn process(&self, event: &StreamEvent) -> ProcessingResult {
    let position = event.position.stream_position.value();
    self.calls.lock().await.push(Call {
      position,
      retried: false,
      retry_count: 0,
    });
    self.outcome(position).await
  }

  async fn process_retry(
    &self,
    event: &StreamEvent,
    _failure_reason: &str,
    retry_count: u32,
  ) -> ProcessingResult {
    let position = event.position.stream_position.value();
    self.calls.lock().await.push(Call {
      position,
      retried: true,
      retry_count,
    });
    self.outcome(position).await
  }
}

/// Store that records every persisted snapshot in order.
#[derive(Default)]
struct RecordingStore {
  inner: InMemoryCheckpointStore,
  persisted: Mutex<Vec<StreamProcessorState>>,
}

impl RecordingStore {
  fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  async fn persisted(&self) -> Vec<StreamProcessorState> {
    self.persisted.lock().await.clone()
  }
}

#[async_trait::async_trait]
impl CheckpointStore for RecordingStore {
  async fn load(
    &self,
    id: &StreamProcessorId,
  ) -> Result<Option<StreamProcessorState>, CheckpointError> {
    self.inner.load(id).await
  }

  async fn persist(
    &self,
    id: &StreamProcessorId,
    state: &StreamProcessorState,
  ) -> Result<(), CheckpointError> {
    self.persisted.lock().await.push(state.clone());
    self.inner.persist(id, state).await
  }
}

/// Fetcher that fails a fixed number of reads before delegating to the log.
struct FlakyFetcher {
  log: Arc<InMemoryEventLog>,
  failures_left: Mutex<u32>,
}

#[async_trait::async_trait]
impl EventFetcher for FlakyFetcher {
  async fn fetch_next(
    &self,
    position: StreamPosition,
  ) -> Result<Option<StreamEvent>, FetchError> {
    let mut left = self.failures_left.lock().await;
    if *left > 0 {
      *left -= 1;
      return Err(FetchError::Read("connection reset".into()));
    }
    drop(left);
    self.log.fetch_next(position).await
  }

  async fn fetch_in_partition(
    &self,
    partition: &PartitionId,
    position: StreamPosition,
  ) -> Result<Option<StreamEvent>, FetchError> {
    self.log.fetch_in_partition(partition, position).await
  }
}

#[tokio::test]
async fn processes_events_in_order_and_checkpoints_each() {
  let log = Arc::new(InMemoryEventLog::new());
  for n in 0..3 {
    log.append("p", "order-placed", json!({ "n": n })).await;
  }
  let processor = ScriptedProcessor::new();
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(log.clone(), log.clone()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(3)
  })
  .await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();

  assert_eq!(
    processor.calls().await,
    vec![
      Call { position: 0, retried: false, retry_count: 0 },
      Call { position: 1, retried: false, retry_count: 0 },
      Call { position: 2, retried: false, retry_count: 0 },
    ]
  );
  let cursors: Vec<u64> = store
    .persisted()
    .await
    .iter()
    .map(|state| state.position().stream_position.value())
    .collect();
  assert_eq!(cursors, vec![1, 2, 3]);
  let reloaded = store
    .load(&processor_id("projector"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reloaded.position(), position(3));
}

#[tokio::test]
async fn failure_pins_position_until_retry_succeeds() {
  let log = Arc::new(InMemoryEventLog::new());
  for n in 0..3 {
    log.append("p", "order-placed", json!({ "n": n })).await;
  }
  let processor = ScriptedProcessor::new();
  processor
    .plan(1, vec![ProcessingResult::retry("projection store offline", Duration::from_millis(20))])
    .await;
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(log.clone(), log.clone()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(3)
  })
  .await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();

  assert_eq!(
    processor.calls().await,
    vec![
      Call { position: 0, retried: false, retry_count: 0 },
      Call { position: 1, retried: false, retry_count: 0 },
      Call { position: 1, retried: true, retry_count: 0 },
      Call { position: 2, retried: false, retry_count: 0 },
    ]
  );
  let persisted = store.persisted().await;
  let failing = unpartitioned(&persisted[1]);
  assert!(failing.is_failing);
  assert_eq!(failing.position, position(1));
  assert_eq!(failing.processing_attempts, 1);
  assert_eq!(failing.failure_reason.as_deref(), Some("projection store offline"));
  let cursors: Vec<u64> = persisted
    .iter()
    .map(|state| state.position().stream_position.value())
    .collect();
  assert_eq!(cursors, vec![1, 1, 2, 3]);
}

#[tokio::test]
async fn fatal_failure_parks_the_stream() {
  let log = Arc::new(InMemoryEventLog::new());
  log.append("p", "order-placed", json!({})).await;
  log.append("p", "order-shipped", json!({})).await;
  let processor = ScriptedProcessor::new();
  processor.plan(0, vec![ProcessingResult::fatal("poison event")]).await;
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(log.clone(), log.clone()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(20)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  let parked = wait_until(&handle, |state| unpartitioned(state).is_failing).await;
  let parked = unpartitioned(&parked);
  assert_eq!(parked.position, position(0));
  assert_eq!(parked.processing_attempts, 1);
  assert_eq!(parked.retry_time, RETRY_NEVER);
  assert_eq!(parked.failure_reason.as_deref(), Some("poison event"));

  // several retry waits pass without another attempt
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(processor.calls().await.len(), 1);

  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();
}

#[tokio::test]
async fn reset_rewinds_and_clears_failing_bookkeeping() {
  let log = Arc::new(InMemoryEventLog::new());
  log.append("p", "order-placed", json!({})).await;
  log.append("p", "order-shipped", json!({})).await;
  let processor = ScriptedProcessor::new();
  processor.plan(0, vec![ProcessingResult::fatal("poison event")]).await;
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(log.clone(), log.clone()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(20)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| unpartitioned(state).is_failing).await;
  let rejected = handle.reset_to_position(position(5)).await;
  assert!(matches!(rejected, Err(ResetError::AheadOfCurrent { .. })));

  handle.reset_to_position(ProcessingPosition::initial()).await.unwrap();
  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(2)
  })
  .await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();

  // the second attempt at position 0 is a fresh first attempt, not a retry
  assert_eq!(
    processor.calls().await,
    vec![
      Call { position: 0, retried: false, retry_count: 0 },
      Call { position: 0, retried: false, retry_count: 0 },
      Call { position: 1, retried: false, retry_count: 0 },
    ]
  );
}

#[tokio::test]
async fn reset_under_push_driver_reprocesses_the_rewound_range() {
  let log = Arc::new(InMemoryEventLog::new());
  for n in 0..4 {
    log.append("p", "order-placed", json!({ "n": n })).await;
  }
  let processor = ScriptedProcessor::new();
  let store = RecordingStore::new();
  let resubscribe = {
    let log = log.clone();
    move |from| log.subscribe(from)
  };
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PushDriver::new(log.subscribe(StreamPosition::new(0))).with_resubscribe(resubscribe),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(4)
  })
  .await;
  handle.reset_to_position(position(1)).await.unwrap();
  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(4)
  })
  .await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();

  // the rewound range is delivered again from the fresh subscription
  let positions: Vec<u64> = processor
    .calls()
    .await
    .iter()
    .map(|call| call.position)
    .collect();
  assert_eq!(positions, vec![0, 1, 2, 3, 1, 2, 3]);
}

#[tokio::test]
async fn reset_is_rejected_when_the_feed_cannot_rewind() {
  let log = Arc::new(InMemoryEventLog::new());
  log.append("p", "order-placed", json!({})).await;
  log.append("p", "order-shipped", json!({})).await;
  let processor = ScriptedProcessor::new();
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PushDriver::new(log.subscribe(StreamPosition::new(0))),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(2)
  })
  .await;
  let rejected = handle.reset_to_position(position(0)).await;
  assert!(matches!(rejected, Err(ResetError::CannotRewind)));

  // the checkpoint was not rewound
  assert_eq!(handle.state().position(), position(2));
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();
  assert_eq!(processor.calls().await.len(), 2);
}

#[tokio::test]
async fn cancellation_mid_wait_leaves_no_checkpoint_behind() {
  let log = Arc::new(InMemoryEventLog::new());
  let processor = ScriptedProcessor::new();
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(log.clone(), log.clone()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  tokio::time::sleep(Duration::from_millis(30)).await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();

  assert!(store.persisted().await.is_empty());
  assert!(store.load(&processor_id("projector")).await.unwrap().is_none());
}

#[tokio::test]
async fn checkpoint_with_wrong_shape_is_fatal() {
  let store = RecordingStore::new();
  store
    .persist(&processor_id("projector"), &PartitionedState::initial().into())
    .await
    .unwrap();
  let log = Arc::new(InMemoryEventLog::new());
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    ScriptedProcessor::new(),
    PullDriver::new(log.clone(), log.clone()),
    store,
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let (_shutdown, shutdown_rx) = watch::channel(false);

  let outcome = engine.run(shutdown_rx).await;
  assert!(matches!(
    outcome,
    Err(StreamProcessorError::StateShape {
      expected: "unpartitioned",
      actual: "partitioned",
      ..
    })
  ));
}

#[tokio::test]
async fn push_and_pull_drivers_walk_identical_transitions() {
  async fn transitions_with<D>(
    processor: Arc<ScriptedProcessor>,
    driver: D,
    store: Arc<RecordingStore>,
  ) -> Vec<(u64, bool, u32)>
  where
    D: EventDriver + 'static,
  {
    let engine = UnpartitionedProcessor::new(
      processor_id("projector"),
      processor,
      driver,
      store.clone(),
      BoundedRetryTime::new(Duration::from_millis(30)),
      fast_config(),
    );
    let handle = engine.handle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));
    wait_until(&handle, |state| {
      state.position().stream_position == StreamPosition::new(3)
    })
    .await;
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
    store
      .persisted()
      .await
      .iter()
      .map(|state| {
        let state = unpartitioned(state);
        (
          state.position.stream_position.value(),
          state.is_failing,
          state.processing_attempts,
        )
      })
      .collect()
  }

  let log = Arc::new(InMemoryEventLog::new());
  log.append("p", "order-placed", json!({})).await;
  log.append("p", "order-shipped", json!({})).await;
  log.append("p", "order-billed", json!({})).await;

  let pull_processor = ScriptedProcessor::new();
  pull_processor
    .plan(1, vec![ProcessingResult::retry("flaky sink", Duration::from_millis(10))])
    .await;
  let pull = transitions_with(
    pull_processor,
    PullDriver::new(log.clone(), log.clone()),
    RecordingStore::new(),
  )
  .await;

  let push_processor = ScriptedProcessor::new();
  push_processor
    .plan(1, vec![ProcessingResult::retry("flaky sink", Duration::from_millis(10))])
    .await;
  let push = transitions_with(
    push_processor,
    PushDriver::new(log.subscribe(StreamPosition::new(0))),
    RecordingStore::new(),
  )
  .await;

  assert_eq!(pull, vec![(1, false, 0), (1, true, 1), (2, false, 0), (3, false, 0)]);
  assert_eq!(pull, push);
}

#[tokio::test]
async fn closed_push_feed_stops_the_processor() {
  let log = Arc::new(InMemoryEventLog::new());
  let first = log.append("p", "order-placed", json!({})).await;
  let second = log.append("p", "order-shipped", json!({})).await;
  let (feed_tx, feed_rx) = mpsc::channel(4);
  feed_tx.try_send(first).unwrap();
  feed_tx.try_send(second).unwrap();
  drop(feed_tx);

  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    ScriptedProcessor::new(),
    PushDriver::new(ReceiverStream::new(feed_rx).boxed()),
    store.clone(),
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let (_shutdown, shutdown_rx) = watch::channel(false);

  let outcome = engine.run(shutdown_rx).await;
  assert!(matches!(
    outcome,
    Err(StreamProcessorError::DriverClosed { .. })
  ));
  // both delivered events were processed and checkpointed before the stop
  let reloaded = store
    .load(&processor_id("projector"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reloaded.position(), position(2));
}

#[tokio::test]
async fn transient_fetch_errors_back_off_and_recover() {
  let log = Arc::new(InMemoryEventLog::new());
  log.append("p", "order-placed", json!({})).await;
  let flaky = Arc::new(FlakyFetcher {
    log: log.clone(),
    failures_left: Mutex::new(2),
  });
  let processor = ScriptedProcessor::new();
  let store = RecordingStore::new();
  let engine = UnpartitionedProcessor::new(
    processor_id("projector"),
    processor.clone(),
    PullDriver::new(flaky, log.clone()),
    store,
    BoundedRetryTime::new(Duration::from_millis(50)),
    fast_config(),
  );
  let handle = engine.handle();
  let (shutdown, shutdown_rx) = watch::channel(false);
  let task = tokio::spawn(engine.run(shutdown_rx));

  wait_until(&handle, |state| {
    state.position().stream_position == StreamPosition::new(1)
  })
  .await;
  shutdown.send(true).unwrap();
  task.await.unwrap().unwrap();
  assert_eq!(processor.calls().await.len(), 1);
}
