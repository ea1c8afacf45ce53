//! Live-update context
//!
//! Workflows push updates to connected subscribers through two operations:
//! `broadcast` (ephemeral) and `emit` (persisted to `sse_messages`). During
//! replay both are no-ops: emitted rows were already persisted by the cycle
//! that originally executed, and broadcasts are never persisted at all. The
//! first actually-executed `run` step flips the context out of replay mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::persistence::InstanceStore;
use crate::schema::Schema;

/// Graceful end of the stream.
pub const CLOSE_NORMAL: u16 = 1000;
/// The workflow declares no update schemas.
pub const CLOSE_NO_UPDATES: u16 = 1008;
/// The workflow ended with an unexpected error.
pub const CLOSE_ERROR: u16 = 1011;

/// A frame delivered to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiveFrame {
    /// An update frame: `{event, data}`.
    Message { event: String, data: Value },
    /// Close sentinel with a close code.
    Close { code: u16 },
}

/// Subscriber set and replay flag shared across replay cycles.
pub(crate) struct LiveShared {
    replay: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<LiveFrame>>>,
}

impl LiveShared {
    pub(crate) fn new() -> Self {
        Self {
            replay: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_replay(&self, replay: bool) {
        self.replay.store(replay, Ordering::Relaxed);
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.replay.load(Ordering::Relaxed)
    }

    pub(crate) fn exit_replay(&self) {
        self.set_replay(false);
    }

    /// Send a close frame to every subscriber and clear the set.
    pub(crate) fn close(&self, code: u16) {
        let mut subscribers = self.subscribers.lock();
        let count = subscribers.len();
        for tx in subscribers.drain(..) {
            let _ = tx.try_send(LiveFrame::Close { code });
        }
        if count > 0 {
            debug!(code, count, "closed live subscribers");
        }
    }
}

/// The subscriber-facing channel handed to workflow bodies.
#[derive(Clone)]
pub struct LiveContext {
    shared: Arc<LiveShared>,
    store: Arc<dyn InstanceStore>,
    schemas: Arc<HashMap<String, Schema>>,
    clock: Clock,
}

impl LiveContext {
    pub(crate) fn new(
        shared: Arc<LiveShared>,
        store: Arc<dyn InstanceStore>,
        schemas: Arc<HashMap<String, Schema>>,
        clock: Clock,
    ) -> Self {
        Self {
            shared,
            store,
            schemas,
            clock,
        }
    }

    /// Whether this workflow declares any update schemas. Without them the
    /// context is a no-op.
    pub fn is_enabled(&self) -> bool {
        !self.schemas.is_empty()
    }

    pub(crate) fn set_replay(&self, replay: bool) {
        self.shared.set_replay(replay);
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.shared.is_replay()
    }

    /// Send an ephemeral update to connected subscribers. Never persisted;
    /// skipped entirely during replay.
    pub fn broadcast(&self, event: &str, data: Value) -> Result<(), EngineError> {
        if !self.is_enabled() || self.is_replay() {
            return Ok(());
        }
        let data = self.validated(event, data)?;
        self.send_all(LiveFrame::Message {
            event: event.to_string(),
            data,
        });
        Ok(())
    }

    /// Send an update and persist it, so future subscribers replay it. A
    /// no-op during replay: the row was appended by the original execution.
    pub async fn emit(&self, event: &str, data: Value) -> Result<(), EngineError> {
        if !self.is_enabled() || self.is_replay() {
            return Ok(());
        }
        let data = self.validated(event, data)?;
        self.store
            .append_live_message(event, &data, self.clock.now_ms())
            .await?;
        self.send_all(LiveFrame::Message {
            event: event.to_string(),
            data,
        });
        Ok(())
    }

    /// Attach a new subscriber. All persisted messages are replayed into the
    /// channel before it joins the live set.
    pub(crate) async fn subscribe(
        &self,
        buffer: usize,
    ) -> Result<mpsc::Receiver<LiveFrame>, EngineError> {
        let backlog = self.store.list_live_messages().await?;
        let (tx, rx) = mpsc::channel(backlog.len() + buffer.max(1));

        for message in backlog {
            // Capacity covers the whole backlog; a failure means the
            // receiver is already gone.
            if tx
                .try_send(LiveFrame::Message {
                    event: message.event,
                    data: message.data,
                })
                .is_err()
            {
                break;
            }
        }

        self.shared.subscribers.lock().push(tx);
        Ok(rx)
    }

    /// Send a close frame to every subscriber and clear the set.
    pub(crate) fn close(&self, code: u16) {
        self.shared.close(code);
    }

    fn validated(&self, event: &str, data: Value) -> Result<Value, EngineError> {
        let schema = self.schemas.get(event).ok_or_else(|| {
            EngineError::validation(format!("workflow declares no update {event:?}"))
        })?;
        schema
            .validate(&data)
            .map_err(|e| EngineError::validation(format!("update {event:?}: {e}")))?;
        Ok(data)
    }

    fn send_all(&self, frame: LiveFrame) {
        // Subscribers that error on write are evicted silently.
        self.shared
            .subscribers
            .lock()
            .retain(|tx| tx.try_send(frame.clone()).is_ok());
    }
}
