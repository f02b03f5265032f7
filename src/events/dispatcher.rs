//! Event dispatcher — id assignment, de-duplication, persistence, and
//! broadcast fan-out with resumable subscriber streams.
//!
//! The dispatcher is the sole writer of the persisted event log. Per-session
//! delivery is FIFO in production order; a slow consumer that overflows the
//! bounded broadcast buffer loses the oldest events and receives a synthetic
//! `stream_lag` marker instead.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{derive_event_id, DebateEvent, EventKind};
use crate::session::SharedSessionStore;
use crate::state::DebatePhase;

/// Broadcast buffer capacity per session.
const CHANNEL_CAPACITY: usize = 256;

/// Error type for dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to persist event: {0}")]
    PersistFailed(String),

    #[error("event stream closed")]
    StreamClosed,
}

/// Shared reference to an [`EventDispatcher`].
pub type SharedDispatcher = Arc<EventDispatcher>;

/// Per-session event dispatcher.
pub struct EventDispatcher {
    session_id: String,
    store: SharedSessionStore,
    sender: broadcast::Sender<DebateEvent>,
    seen: Mutex<HashSet<String>>,
    sequence: AtomicU64,
}

impl EventDispatcher {
    /// Create a dispatcher bound to one session and its store.
    pub fn new(session_id: &str, store: SharedSessionStore) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            store,
            sender,
            seen: Mutex::new(HashSet::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Create a shared reference.
    pub fn shared(self) -> SharedDispatcher {
        Arc::new(self)
    }

    /// Session this dispatcher serves.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Seed the de-dup set and sequence counter from a persisted log, so a
    /// resumed session keeps producing ids past the replayed tail.
    pub async fn recover(&self) -> Result<(), EventError> {
        let events = self
            .store
            .load_events_since(&self.session_id, None)
            .await
            .map_err(|e| EventError::PersistFailed(e.to_string()))?;
        let count = events.len() as u64;
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        for event in events {
            seen.insert(event.event_id);
        }
        drop(seen);
        self.sequence.fetch_max(count, Ordering::SeqCst);
        debug!(session_id = %self.session_id, replayed = count, "dispatcher recovered");
        Ok(())
    }

    /// Emit one event: assign an id if the source did not provide one,
    /// de-duplicate, persist, then broadcast.
    ///
    /// `node` names the producing graph node and feeds the id derivation.
    pub async fn emit(&self, node: &str, mut event: DebateEvent) -> Result<(), EventError> {
        if event.event_id.is_empty() {
            let index = self.sequence.fetch_add(1, Ordering::SeqCst);
            event.event_id = derive_event_id(&self.session_id, node, index);
        }
        if event.session_id.is_empty() {
            event.session_id = self.session_id.clone();
        }

        {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            if !seen.insert(event.event_id.clone()) {
                debug!(event_id = %event.event_id, "duplicate event suppressed");
                return Ok(());
            }
        }

        self.store
            .append_event(&self.session_id, &event)
            .await
            .map_err(|e| EventError::PersistFailed(e.to_string()))?;

        // Broadcast to subscribers; no receivers is fine, the log has it.
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                debug!(
                    event_type = event.type_name(),
                    event_id = %event.event_id,
                    receivers,
                    "event published"
                );
            }
            Err(_) => {
                debug!(
                    event_type = event.type_name(),
                    event_id = %event.event_id,
                    "event published (no receivers)"
                );
            }
        }
        Ok(())
    }

    /// Convenience: build an envelope and emit it in one step.
    pub async fn emit_kind(
        &self,
        node: &str,
        phase: DebatePhase,
        agent_name: Option<&str>,
        kind: EventKind,
    ) -> Result<(), EventError> {
        let mut event = DebateEvent::new(&self.session_id, phase, kind);
        if let Some(agent) = agent_name {
            event = event.with_agent(agent);
        }
        self.emit(node, event).await
    }

    /// Subscribe with an optional resume cursor (last `event_id` seen).
    /// The persisted tail after the cursor is replayed first, then the
    /// subscription joins the live stream. Events seen in the replay are
    /// suppressed if the live stream delivers them again.
    pub async fn subscribe(
        &self,
        resume_cursor: Option<&str>,
    ) -> Result<EventSubscription, EventError> {
        // Register for live events before loading the tail so nothing
        // falls between replay and live.
        let live = self.sender.subscribe();
        let replay = self
            .store
            .load_events_since(&self.session_id, resume_cursor)
            .await
            .map_err(|e| EventError::PersistFailed(e.to_string()))?;
        let delivered: HashSet<String> =
            replay.iter().map(|e| e.event_id.clone()).collect();
        Ok(EventSubscription {
            session_id: self.session_id.clone(),
            replay: replay.into(),
            live,
            delivered,
            closed: false,
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A resumable per-session event stream: replayed tail first, then live.
pub struct EventSubscription {
    session_id: String,
    replay: VecDeque<DebateEvent>,
    live: broadcast::Receiver<DebateEvent>,
    delivered: HashSet<String>,
    closed: bool,
}

impl EventSubscription {
    /// Receive the next event, or `None` once the stream has closed and the
    /// replay buffer is drained.
    pub async fn next(&mut self) -> Option<DebateEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        if self.closed {
            return None;
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    // Replay/live overlap suppression.
                    if self.delivered.contains(&event.event_id) {
                        continue;
                    }
                    self.delivered.insert(event.event_id.clone());
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %self.session_id,
                        skipped,
                        "subscriber lagged; oldest events dropped"
                    );
                    return Some(DebateEvent::new(
                        &self.session_id,
                        DebatePhase::Init,
                        EventKind::StreamLag { skipped },
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Cursor for resuming a future subscription: the id of the last event
    /// this subscription delivered from the replay buffer, if any.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use crate::state::DebatePhase;

    fn test_dispatcher() -> (SharedDispatcher, SharedSessionStore) {
        let store: SharedSessionStore = Arc::new(MemorySessionStore::new());
        let dispatcher = EventDispatcher::new("sess-1", store.clone()).shared();
        (dispatcher, store)
    }

    fn started_event() -> DebateEvent {
        DebateEvent::new(
            "sess-1",
            DebatePhase::Init,
            EventKind::SessionStarted {
                incident_id: "inc-1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_emit_assigns_stable_id() {
        let (dispatcher, store) = test_dispatcher();
        dispatcher.emit("init_session", started_event()).await.unwrap();

        let events = store.load_events_since("sess-1", None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, derive_event_id("sess-1", "init_session", 0));
    }

    #[tokio::test]
    async fn test_duplicate_envelope_suppressed() {
        let (dispatcher, store) = test_dispatcher();
        let mut event = started_event();
        event.event_id = "evt_fixed".to_string();

        dispatcher.emit("init_session", event.clone()).await.unwrap();
        dispatcher.emit("init_session", event).await.unwrap();

        let events = store.load_events_since("sess-1", None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_fifo_order() {
        let (dispatcher, _store) = test_dispatcher();
        let mut sub = dispatcher.subscribe(None).await.unwrap();

        for round in 0..3 {
            dispatcher
                .emit_kind(
                    "supervisor_decide",
                    DebatePhase::Analysis,
                    None,
                    EventKind::AgentCommandIssued {
                        target: format!("Agent{round}"),
                        round,
                        task: "t".to_string(),
                        use_tool: crate::state::ToolUse::Forbidden,
                    },
                )
                .await
                .unwrap();
        }

        for round in 0..3 {
            let event = sub.next().await.unwrap();
            match event.kind {
                EventKind::AgentCommandIssued { target, .. } => {
                    assert_eq!(target, format!("Agent{round}"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_resume_cursor_replays_tail_without_gaps() {
        let (dispatcher, _store) = test_dispatcher();
        for _ in 0..5 {
            dispatcher.emit("node", started_event()).await.unwrap();
        }
        // First subscription reads everything; remember the cursor after two.
        let mut sub = dispatcher.subscribe(None).await.unwrap();
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_ne!(first.event_id, second.event_id);

        let mut resumed = dispatcher.subscribe(Some(&second.event_id)).await.unwrap();
        let mut replayed = Vec::new();
        for _ in 0..3 {
            replayed.push(resumed.next().await.unwrap().event_id);
        }
        // Exactly the three events after the cursor, in order, no dups.
        let expected: Vec<String> =
            (2..5).map(|i| derive_event_id("sess-1", "node", i)).collect();
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn test_recover_continues_sequence() {
        let store: SharedSessionStore = Arc::new(MemorySessionStore::new());
        {
            let dispatcher = EventDispatcher::new("sess-1", store.clone());
            dispatcher.emit("node", started_event()).await.unwrap();
            dispatcher.emit("node", started_event()).await.unwrap();
        }
        // New dispatcher over the same store (process restart).
        let dispatcher = EventDispatcher::new("sess-1", store.clone());
        dispatcher.recover().await.unwrap();
        dispatcher.emit("node", started_event()).await.unwrap();

        let events = store.load_events_since("sess-1", None).await.unwrap();
        let ids: HashSet<String> = events.iter().map(|e| e.event_id.clone()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(ids.len(), 3, "ids must remain unique across restarts");
        assert_eq!(events[2].event_id, derive_event_id("sess-1", "node", 2));
    }
}
