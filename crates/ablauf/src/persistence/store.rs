//! InstanceStore trait and row types
//!
//! Each actor owns a private store with four tables (`workflow`, `steps`,
//! `sse_messages`, `event_buffer`); index shard actors additionally use the
//! `instances` table. A [`StorageBackend`] opens one store per actor name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Row inserted, first replay not yet started
    Created,

    /// Actively replaying or runnable
    Running,

    /// Finished with a result
    Completed,

    /// Finished with an error
    Errored,

    /// Paused by an external caller
    Paused,

    /// Suspended until a wall-clock wake-up
    Sleeping,

    /// Suspended until an external event arrives
    Waiting,

    /// Terminated by an external caller
    Terminated,
}

impl WorkflowStatus {
    /// Terminal states are sticky: no operation leaves this set.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Paused => "paused",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "paused" => Ok(Self::Paused),
            "sleeping" => Ok(Self::Sleeping),
            "waiting" => Ok(Self::Waiting),
            "terminated" => Ok(Self::Terminated),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Do,
    Sleep,
    SleepUntil,
    WaitForEvent,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::Sleep => "sleep",
            Self::SleepUntil => "sleep_until",
            Self::WaitForEvent => "wait_for_event",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "do" => Ok(Self::Do),
            "sleep" => Ok(Self::Sleep),
            "sleep_until" => Ok(Self::SleepUntil),
            "wait_for_event" => Ok(Self::WaitForEvent),
            other => Err(StoreError::Serialization(format!(
                "unknown step type {other:?}"
            ))),
        }
    }
}

/// Step record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Sleeping,
    Waiting,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "sleeping" => Ok(Self::Sleeping),
            "waiting" => Ok(Self::Waiting),
            other => Err(StoreError::Serialization(format!(
                "unknown step status {other:?}"
            ))),
        }
    }
}

/// The single `workflow` row of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub paused: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One recorded failure of a `run` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    pub timestamp: i64,
    pub duration_ms: i64,
}

/// A step record, keyed by its unique name within the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub attempts: u32,
    pub wake_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub retry_history: Vec<RetryAttempt>,
}

impl StepRow {
    /// Fresh record for a step about to run for the first time.
    pub fn new(name: &str, step_type: StepType, status: StepStatus) -> Self {
        Self {
            name: name.to_string(),
            step_type,
            status,
            result: None,
            error: None,
            error_stack: None,
            attempts: 0,
            wake_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_history: Vec::new(),
        }
    }
}

/// A buffered event awaiting its `wait_for_event` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBufferRow {
    pub event: String,
    pub payload: Value,
    pub received_at: i64,
}

/// A persisted live-update message (`emit` only; broadcasts are ephemeral).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessageRow {
    pub seq: i64,
    pub event: String,
    pub data: Value,
    pub created_at: i64,
}

/// Index entry projected into a shard actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub status: WorkflowStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Private persistent storage of one actor.
///
/// Implementations must keep `updated_at` columns non-decreasing and preserve
/// `created_at` on index upserts. All methods operate on the tables of the
/// one actor the store was opened for.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    /// Apply schema migrations. Must be idempotent.
    async fn migrate(&self) -> Result<(), StoreError>;

    // =========================================================================
    // Workflow row
    // =========================================================================

    async fn get_workflow(&self) -> Result<Option<WorkflowRow>, StoreError>;

    async fn insert_workflow(&self, row: &WorkflowRow) -> Result<(), StoreError>;

    /// Update status (and optionally the paused flag), clamping `updated_at`
    /// to be non-decreasing.
    async fn update_status(
        &self,
        status: WorkflowStatus,
        paused: Option<bool>,
        updated_at: i64,
    ) -> Result<(), StoreError>;

    /// Move the workflow into a terminal or rest state with result/error.
    async fn finish_workflow(
        &self,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
        updated_at: i64,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, name: &str) -> Result<Option<StepRow>, StoreError>;

    async fn list_steps(&self) -> Result<Vec<StepRow>, StoreError>;

    async fn upsert_step(&self, row: &StepRow) -> Result<(), StoreError>;

    // =========================================================================
    // Event buffer
    // =========================================================================

    /// Upsert a buffered event; last write wins per event name.
    async fn buffer_event(
        &self,
        event: &str,
        payload: &Value,
        received_at: i64,
    ) -> Result<(), StoreError>;

    /// Remove and return the buffered entry for an event, if any.
    async fn take_event(&self, event: &str) -> Result<Option<EventBufferRow>, StoreError>;

    async fn clear_event_buffer(&self) -> Result<(), StoreError>;

    // =========================================================================
    // Live messages
    // =========================================================================

    /// Append a persisted live message, returning its sequence number.
    async fn append_live_message(
        &self,
        event: &str,
        data: &Value,
        created_at: i64,
    ) -> Result<i64, StoreError>;

    async fn list_live_messages(&self) -> Result<Vec<LiveMessageRow>, StoreError>;

    // =========================================================================
    // Index shard table
    // =========================================================================

    /// Upsert keyed by id; on conflict only `status` and `updated_at` change,
    /// and `updated_at` never decreases.
    async fn index_upsert(&self, entry: &IndexEntry) -> Result<(), StoreError>;

    async fn index_list(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, StoreError>;
}

/// Factory for per-actor stores.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Open (or create) the store for the given actor name.
    async fn open(&self, actor: &str) -> Result<Arc<dyn InstanceStore>, StoreError>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    async fn open(&self, actor: &str) -> Result<Arc<dyn InstanceStore>, StoreError> {
        (**self).open(actor).await
    }
}
