//! Pluggable workflow/step lifecycle observability
//!
//! The runner creates one [`Collector`] per replay cycle, records lifecycle
//! events into it through the provider hooks, and flushes it in the
//! background when the cycle ends. Providers are best-effort: a flush
//! failure never affects the source workflow.

mod shard_index;

use async_trait::async_trait;
use serde_json::Value;

pub use shard_index::{index_actor, ShardIndexProvider, ShardRouter};

use crate::error::EngineError;
use crate::persistence::{StepType, WorkflowStatus};

/// Per-cycle batch of lifecycle observations for one workflow.
#[derive(Debug, Clone)]
pub struct Collector {
    pub id: String,
    pub workflow_type: String,
    pub created_at: Option<i64>,
    pub status: Option<WorkflowStatus>,
    pub updated_at: i64,
    pub steps: Vec<StepObservation>,
}

impl Collector {
    pub fn new(id: &str, workflow_type: &str) -> Self {
        Self {
            id: id.to_string(),
            workflow_type: workflow_type.to_string(),
            created_at: None,
            status: None,
            updated_at: 0,
            steps: Vec::new(),
        }
    }
}

/// A step-level lifecycle observation.
#[derive(Debug, Clone)]
pub enum StepObservation {
    Started {
        name: String,
        step_type: StepType,
        timestamp: i64,
    },
    Completed {
        name: String,
        step_type: StepType,
        duration_ms: i64,
        timestamp: i64,
    },
    Retry {
        name: String,
        attempt: u32,
        error: String,
        error_stack: Option<String>,
        next_retry_at: i64,
        timestamp: i64,
    },
}

/// Filter for the provider read side.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one workflow type; `None` means every registered type.
    pub workflow_type: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub limit: Option<usize>,
}

/// An index entry joined with its workflow type.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedWorkflow {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Sink for workflow and step lifecycle events.
///
/// The recording hooks have defaults that batch into the collector, so most
/// providers only implement `flush` (and optionally the read side). All
/// calls are best-effort; the engine never blocks a replay cycle on them.
#[async_trait]
pub trait ObservabilityProvider: Send + Sync + 'static {
    fn create_collector(&self, id: &str, workflow_type: &str) -> Collector {
        Collector::new(id, workflow_type)
    }

    fn on_workflow_start(&self, collector: &mut Collector, _payload: &Value, timestamp: i64) {
        collector.created_at = Some(timestamp);
        collector.updated_at = collector.updated_at.max(timestamp);
    }

    fn on_workflow_status_change(
        &self,
        collector: &mut Collector,
        status: WorkflowStatus,
        created_at: Option<i64>,
        timestamp: i64,
    ) {
        collector.status = Some(status);
        if collector.created_at.is_none() {
            collector.created_at = created_at;
        }
        collector.updated_at = collector.updated_at.max(timestamp);
    }

    fn on_step_start(
        &self,
        collector: &mut Collector,
        name: &str,
        step_type: StepType,
        timestamp: i64,
    ) {
        collector.steps.push(StepObservation::Started {
            name: name.to_string(),
            step_type,
            timestamp,
        });
    }

    fn on_step_complete(
        &self,
        collector: &mut Collector,
        name: &str,
        step_type: StepType,
        duration_ms: i64,
        timestamp: i64,
    ) {
        collector.steps.push(StepObservation::Completed {
            name: name.to_string(),
            step_type,
            duration_ms,
            timestamp,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_step_retry(
        &self,
        collector: &mut Collector,
        name: &str,
        attempt: u32,
        error: &str,
        error_stack: Option<&str>,
        next_retry_at: i64,
        timestamp: i64,
    ) {
        collector.steps.push(StepObservation::Retry {
            name: name.to_string(),
            attempt,
            error: error.to_string(),
            error_stack: error_stack.map(str::to_string),
            next_retry_at,
            timestamp,
        });
    }

    /// Flush a finished cycle. `reason` is the workflow status that ended it.
    async fn flush(&self, collector: Collector, reason: WorkflowStatus)
        -> Result<(), EngineError>;

    /// List indexed workflows across the fleet.
    async fn list_workflows(
        &self,
        _filter: ListFilter,
    ) -> Result<Vec<ListedWorkflow>, EngineError> {
        Err(EngineError::observability_disabled())
    }

    /// Look up a single indexed workflow by id.
    async fn get_indexed(&self, _id: &str) -> Result<Option<ListedWorkflow>, EngineError> {
        Err(EngineError::observability_disabled())
    }
}

/// Provider that records nothing. The read side reports
/// `OBSERVABILITY_DISABLED`.
pub struct DisabledObservability;

#[async_trait]
impl ObservabilityProvider for DisabledObservability {
    fn create_collector(&self, id: &str, workflow_type: &str) -> Collector {
        Collector::new(id, workflow_type)
    }

    async fn flush(
        &self,
        _collector: Collector,
        _reason: WorkflowStatus,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}
