//! # EventWeave
//!
//! Durable, restartable consumption of event streams in pure Rust.
//!
//! EventWeave drives event processors over the streams of an event-sourced
//! system. A stream processor owns a checkpoint (how far it has come), feeds
//! each event to a pluggable processor, interprets the outcome through a small
//! state machine and persists the resulting state after every transition, so
//! a crash or redeploy resumes exactly where it left off.
//!
//! ## Key Properties
//!
//! - **At-least-once**: an event is never skipped; reprocessing after a crash
//!   is possible, silent loss is not
//! - **Ordered**: events are handled in stream order, per stream or per
//!   partition
//! - **Failure-isolating**: with partitioned streams, one failing partition
//!   catches up on the side while the rest keep flowing
//! - **Pluggable**: event sources, checkpoint stores, retry policies and the
//!   processors themselves are all trait-backed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventweave::event::StreamEvent;
//! use eventweave::fetch::InMemoryEventLog;
//! use eventweave::policy::BoundedRetryTime;
//! use eventweave::processor::{
//!   EventProcessor, PullDriver, StreamProcessorConfig, UnpartitionedProcessor,
//! };
//! use eventweave::result::ProcessingResult;
//! use eventweave::store::InMemoryCheckpointStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Projector;
//!
//! #[async_trait::async_trait]
//! impl EventProcessor for Projector {
//!   async fn process(&self, event: &StreamEvent) -> ProcessingResult {
//!     println!("{}: {}", event.position, event.event_type);
//!     ProcessingResult::succeeded()
//!   }
//! }
//!
//! async fn run() -> Result<(), eventweave::error::StreamProcessorError> {
//!   let log = Arc::new(InMemoryEventLog::new());
//!   let engine = UnpartitionedProcessor::new(
//!     eventweave::identity::StreamProcessorId::new(
//!       "default".into(),
//!       "projector".into(),
//!       "orders".into(),
//!     ),
//!     Arc::new(Projector),
//!     PullDriver::new(log.clone(), log.clone()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     BoundedRetryTime::new(Duration::from_secs(5)),
//!     StreamProcessorConfig::default(),
//!   );
//!   let (_shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
//!   engine.run(shutdown_rx).await
//! }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Position model: stream and event-log coordinates that advance in lockstep.
pub mod position;
/// Identities naming scopes, event processors, streams and partitions.
pub mod identity;
/// The event envelope stream processors consume.
pub mod event;
/// Per-event processing outcomes.
pub mod result;
/// Checkpoint state and the transitions the engines persist.
pub mod state;
/// Errors that stop a stream processor.
pub mod error;
/// Durable checkpoint storage.
pub mod store;
/// Event log access: fetching, waiting and subscribing.
pub mod fetch;
/// Retry-time policies turning stored retry times into waits.
pub mod policy;
/// The stream processor engines and their event drivers.
pub mod processor;
