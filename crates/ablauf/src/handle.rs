//! Client facade for a single workflow instance

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::live::LiveFrame;
use crate::runner::{RunnerHandle, WorkflowSnapshot};
use crate::units::parse_duration;

/// Handle to one workflow instance, addressed by id.
///
/// All methods route through the instance's single-writer actor; the handle
/// itself is cheap to clone and holds no state beyond the id.
#[derive(Clone)]
pub struct WorkflowHandle {
    inner: Arc<EngineInner>,
    id: String,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle").field("id", &self.id).finish()
    }
}

impl WorkflowHandle {
    pub(crate) fn new(inner: Arc<EngineInner>, id: &str) -> Self {
        Self {
            inner,
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn actor(&self) -> Result<RunnerHandle, EngineError> {
        self.inner.clone().actor(&self.id).await
    }

    /// Full snapshot: workflow row plus step rows.
    pub async fn status(&self) -> Result<WorkflowSnapshot, EngineError> {
        self.actor().await?.get_status().await
    }

    /// Deliver an external event. Resolves a waiting step directly, or
    /// buffers (last write wins) until the workflow reaches the matching
    /// `wait_for_event`.
    pub async fn send_event(&self, event: &str, payload: Value) -> Result<(), EngineError> {
        self.actor()
            .await?
            .deliver_event(event.to_string(), payload)
            .await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.actor().await?.pause().await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.actor().await?.resume().await
    }

    /// Graceful cancellation: clears the alarm and event buffer, closes the
    /// live channel, and pins the status to `terminated`.
    pub async fn terminate(&self) -> Result<(), EngineError> {
        self.actor().await?.terminate().await
    }

    /// Subscribe to live updates. All persisted messages are replayed first,
    /// then live frames until a close frame.
    pub async fn subscribe(&self) -> Result<LiveSubscription, EngineError> {
        let rx = self.actor().await?.connect_live().await?;
        Ok(LiveSubscription { rx })
    }
}

/// Reader over a live subscriber channel.
pub struct LiveSubscription {
    rx: mpsc::Receiver<LiveFrame>,
}

impl LiveSubscription {
    /// Next frame, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<LiveFrame> {
        self.rx.recv().await
    }

    /// Wait for a specific update event, discarding other messages.
    /// Fails with `UPDATE_TIMEOUT` when the duration elapses first.
    pub async fn expect(&mut self, event: &str, timeout: &str) -> Result<Value, EngineError> {
        let millis = parse_duration(timeout)? as u64;

        let result = tokio::time::timeout(Duration::from_millis(millis), async {
            loop {
                match self.rx.recv().await {
                    Some(LiveFrame::Message { event: seen, data }) if seen == event => {
                        return Ok(data);
                    }
                    Some(LiveFrame::Message { .. }) => continue,
                    Some(LiveFrame::Close { code }) => {
                        return Err(EngineError::internal(format!(
                            "live channel closed (code {code}) before update {event:?}"
                        )));
                    }
                    None => {
                        return Err(EngineError::internal(format!(
                            "live channel dropped before update {event:?}"
                        )));
                    }
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(EngineError::update_timeout(event)),
        }
    }
}
