//! # Ablauf
//!
//! A durable workflow engine: user-defined async procedures that survive
//! process restarts, pause for wall-clock durations, wait for externally
//! delivered events, and retry failing steps with backoff.
//!
//! ## Features
//!
//! - **Replay-based execution**: the workflow body re-runs from the top on
//!   every wake-up; a persistent step cache makes completed work observable
//!   and at-most-once
//! - **Single-writer actors**: one mailbox-driven task per instance, with
//!   private storage and exactly one alarm
//! - **Durable suspension**: `sleep`, `sleep_until` and `wait_for_event`
//!   suspend by raising tagged interrupts, resumed by the host alarm
//! - **Automatic retries**: fixed/linear/exponential backoff with write-ahead
//!   crash recovery for step bodies
//! - **Live updates**: ephemeral broadcasts and persisted emits pushed to
//!   connected subscribers
//! - **Shard-based index**: cross-instance listing over `__index:<type>:<n>`
//!   shard actors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowHandle                        │
//! │        (client facade: create, events, status, live)        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Runner actor (per id)                   │
//! │   (mailbox loop, replay cycles, alarm, event buffer, live)  │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        InstanceStore                        │
//! │     (workflow, steps, sse_messages, event_buffer tables)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ablauf::prelude::*;
//!
//! struct Approval;
//!
//! #[async_trait::async_trait]
//! impl DurableWorkflow for Approval {
//!     const TYPE: &'static str = "approval";
//!     type Input = ApprovalInput;
//!     type Output = ApprovalResult;
//!
//!     fn config() -> WorkflowConfig {
//!         WorkflowConfig::new()
//!             .with_event("approval", Schema::object([("approved", Schema::Bool)]))
//!     }
//!
//!     async fn run(
//!         &self,
//!         step: &mut StepContext,
//!         payload: Self::Input,
//!         _live: &LiveContext,
//!     ) -> RunResult<Self::Output> {
//!         let name = payload.name.clone();
//!         let greeting: String = step
//!             .run("greet", || async move { Ok(format!("Hello, {name}!")) })
//!             .await?;
//!         step.sleep("pause", "5s").await?;
//!         let approval: ApprovalEvent = step
//!             .wait_for_event_within("approval", "1m")
//!             .await?;
//!         Ok(ApprovalResult::from(approval, greeting))
//!     }
//! }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod handle;
pub mod interrupt;
pub mod live;
pub mod observe;
pub mod persistence;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod shard;
pub mod step;
pub mod units;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig};
    pub use crate::error::{EngineError, ErrorCode, ErrorSource};
    pub use crate::handle::{LiveSubscription, WorkflowHandle};
    pub use crate::interrupt::{Interrupt, RunError, RunResult};
    pub use crate::live::{LiveContext, LiveFrame};
    pub use crate::observe::{ListFilter, ListedWorkflow, ObservabilityProvider};
    pub use crate::persistence::{
        InstanceStore, MemoryBackend, SqliteBackend, StepRow, StepStatus, StepType,
        StorageBackend, WorkflowRow, WorkflowStatus,
    };
    pub use crate::retry::{Backoff, OverflowPolicy, ResultSizeLimit, RetryOverride, RetryPolicy};
    pub use crate::runner::WorkflowSnapshot;
    pub use crate::schema::Schema;
    pub use crate::step::{non_retriable, NonRetriable, StepContext, StepOptions};
    pub use crate::workflow::{DurableWorkflow, WorkflowConfig};
}

// Re-export key types at crate root
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{EngineError, ErrorCode, ErrorSource};
pub use handle::{LiveSubscription, WorkflowHandle};
pub use interrupt::{Interrupt, RunError, RunResult};
pub use live::{LiveContext, LiveFrame, CLOSE_ERROR, CLOSE_NORMAL, CLOSE_NO_UPDATES};
pub use observe::{
    Collector, DisabledObservability, ListFilter, ListedWorkflow, ObservabilityProvider,
    ShardIndexProvider, ShardRouter,
};
pub use persistence::{
    IndexEntry, InstanceStore, MemoryBackend, SqliteBackend, StepRow, StepStatus, StepType,
    StorageBackend, WorkflowRow, WorkflowStatus,
};
pub use retry::{Backoff, OverflowPolicy, ResultSizeLimit, RetryOverride, RetryPolicy};
pub use runner::WorkflowSnapshot;
pub use schema::{Schema, SchemaError};
pub use step::{non_retriable, NonRetriable, StepContext, StepOptions};
pub use workflow::{DurableWorkflow, Registry, WorkflowConfig};
