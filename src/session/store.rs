//! Session persistence interface and the in-memory reference store.
//!
//! Persistent backends live outside this crate; the core only depends on
//! this trait. [`MemorySessionStore`] serves tests and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::DebateEvent;
use crate::state::{DebateState, SessionStatus};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checkpoint not found for session {0}")]
    CheckpointNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A recoverable snapshot written after every node completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning session.
    pub session_id: String,
    /// Session status at checkpoint time.
    pub status: SessionStatus,
    /// Full state snapshot.
    pub state: DebateState,
    /// Name of the node that completed last.
    pub last_node: String,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        session_id: &str,
        status: SessionStatus,
        state: DebateState,
        last_node: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            status,
            state,
            last_node: last_node.to_string(),
            saved_at: Utc::now(),
        }
    }
}

/// Storage collaborator consumed by the core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous one for the session.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Load the latest checkpoint for a session, if any.
    async fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Append one event to the session's event log.
    async fn append_event(&self, session_id: &str, event: &DebateEvent)
        -> Result<(), StoreError>;

    /// Load events after the cursor (exclusive); `None` loads from the start.
    /// An unknown cursor loads the full log, matching a subscriber whose
    /// cursor predates retention.
    async fn load_events_since(
        &self,
        session_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<DebateEvent>, StoreError>;
}

/// Shared reference to a [`SessionStore`].
pub type SharedSessionStore = Arc<dyn SessionStore>;

#[derive(Default)]
struct MemoryStoreInner {
    checkpoints: HashMap<String, Checkpoint>,
    events: HashMap<String, Vec<DebateEvent>>,
}

/// In-memory store. Events round-trip through serde on append so the
/// persisted format matches what a durable backend would hold.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference.
    pub fn shared(self) -> SharedSessionStore {
        Arc::new(self)
    }

    /// Number of persisted events for a session (test helper).
    pub async fn event_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .await
            .events
            .get(session_id)
            .map(|log| log.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .checkpoints
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.checkpoints.get(session_id).cloned())
    }

    async fn append_event(
        &self,
        session_id: &str,
        event: &DebateEvent,
    ) -> Result<(), StoreError> {
        // Round-trip through the wire format so in-memory contents are
        // exactly what a durable backend would replay.
        let encoded = serde_json::to_string(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let decoded: DebateEvent = serde_json::from_str(&encoded)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut inner = self.inner.write().await;
        inner
            .events
            .entry(session_id.to_string())
            .or_default()
            .push(decoded);
        Ok(())
    }

    async fn load_events_since(
        &self,
        session_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<DebateEvent>, StoreError> {
        let inner = self.inner.read().await;
        let log = match inner.events.get(session_id) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };
        let start = match cursor {
            Some(cursor) => log
                .iter()
                .position(|e| e.event_id == cursor)
                .map(|idx| idx + 1)
                .unwrap_or(0),
            None => 0,
        };
        Ok(log[start..].to_vec())
    }
}
