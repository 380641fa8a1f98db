//! Durable checkpoint storage for stream processor state.
//!
//! One record per [`StreamProcessorId`], completely overwritten on every
//! persist. The engine persists after every state transition, so the store is
//! the single source of truth for crash recovery: reload the record, resume
//! from there.

use crate::identity::StreamProcessorId;
use crate::state::StreamProcessorState;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for checkpoint store operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(String),
}

/// Trait for checkpoint store backends.
///
/// `persist` must be atomic from the caller's point of view: a concurrent
/// reader observes either the previous record or the new one, never a
/// half-written state. The store does not arbitrate between writers; the host
/// guarantees at most one active processor per id.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
  /// Loads the persisted state for `id`. `Ok(None)` on first run; the caller
  /// substitutes a fresh initial state.
  async fn load(
    &self,
    id: &StreamProcessorId,
  ) -> Result<Option<StreamProcessorState>, CheckpointError>;

  /// Overwrites the persisted state for `id` with `state`.
  async fn persist(
    &self,
    id: &StreamProcessorId,
    state: &StreamProcessorState,
  ) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store for tests and embedded setups.
pub struct InMemoryCheckpointStore {
  records: tokio::sync::Mutex<HashMap<StreamProcessorId, StreamProcessorState>>,
}

impl Default for InMemoryCheckpointStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self {
      records: tokio::sync::Mutex::new(HashMap::new()),
    }
  }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
  async fn load(
    &self,
    id: &StreamProcessorId,
  ) -> Result<Option<StreamProcessorState>, CheckpointError> {
    let records = self.records.lock().await;
    Ok(records.get(id).cloned())
  }

  async fn persist(
    &self,
    id: &StreamProcessorId,
    state: &StreamProcessorState,
  ) -> Result<(), CheckpointError> {
    let mut records = self.records.lock().await;
    records.insert(id.clone(), state.clone());
    Ok(())
  }
}

/// File-based checkpoint store.
///
/// Each processor's state lives in one JSON document
/// `<base>/<scope>__<processor>__<stream>.json`. Writes go to a temporary
/// file in the same directory and are renamed over the record, so readers
/// never observe a partial write.
pub struct FileCheckpointStore {
  base_path: PathBuf,
}

impl FileCheckpointStore {
  /// Creates a file store rooted at `base_path`. The directory is created on
  /// first persist.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  fn record_path(&self, id: &StreamProcessorId) -> PathBuf {
    let name = format!(
      "{}__{}__{}.json",
      sanitize(id.scope.as_str()),
      sanitize(id.event_processor.as_str()),
      sanitize(id.source_stream.as_str())
    );
    self.base_path.join(name)
  }
}

fn sanitize(part: &str) -> String {
  part.replace(
    |c: char| !c.is_alphanumeric() && c != '_' && c != '-',
    "_",
  )
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
  async fn load(
    &self,
    id: &StreamProcessorId,
  ) -> Result<Option<StreamProcessorState>, CheckpointError> {
    let path = self.record_path(id);
    let json = match tokio::fs::read_to_string(&path).await {
      Ok(json) => json,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let state = serde_json::from_str(&json)
      .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    Ok(Some(state))
  }

  async fn persist(
    &self,
    id: &StreamProcessorId,
    state: &StreamProcessorState,
  ) -> Result<(), CheckpointError> {
    tokio::fs::create_dir_all(&self.base_path).await?;
    let path = self.record_path(id);
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(state)
      .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(())
  }
}
