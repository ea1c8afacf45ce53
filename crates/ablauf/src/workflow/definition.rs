//! Workflow definition trait

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::interrupt::RunResult;
use crate::live::LiveContext;
use crate::retry::{ResultSizeLimit, RetryPolicy};
use crate::schema::Schema;
use crate::step::StepContext;

/// Configuration a workflow type registers with the engine.
#[derive(Debug, Clone, Default)]
pub struct WorkflowConfig {
    /// Deliverable events, by name.
    pub events: HashMap<String, Schema>,

    /// Live update schemas, by name. A workflow with no update schemas gets a
    /// no-op live context.
    pub updates: HashMap<String, Schema>,

    /// Default retry policy for `run` steps.
    pub retries: RetryPolicy,

    /// Budget for the running sum of encoded step results.
    pub result_limit: ResultSizeLimit,
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an event this workflow can receive.
    pub fn with_event(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.events.insert(name.into(), schema);
        self
    }

    /// Declare a live update this workflow can send.
    pub fn with_update(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.updates.insert(name.into(), schema);
        self
    }

    /// Set the default retry policy.
    pub fn with_retries(mut self, retries: RetryPolicy) -> Self {
        self.retries = retries;
        self
    }

    /// Set the result-size budget.
    pub fn with_result_limit(mut self, limit: ResultSizeLimit) -> Self {
        self.result_limit = limit;
        self
    }
}

/// A durable workflow definition.
///
/// The `run` body is re-executed from the top on every replay; apart from
/// step-context calls it must be a pure function of the payload and
/// already-completed step results. Side effects belong inside `run` steps.
///
/// # Example
///
/// ```ignore
/// struct Greeter;
///
/// #[async_trait]
/// impl DurableWorkflow for Greeter {
///     const TYPE: &'static str = "greeter";
///     type Input = GreetInput;
///     type Output = String;
///
///     async fn run(
///         &self,
///         step: &mut StepContext,
///         payload: GreetInput,
///         _live: &LiveContext,
///     ) -> RunResult<String> {
///         let name = payload.name.clone();
///         let greeting: String = step
///             .run("greet", || async move { Ok(format!("Hello, {name}!")) })
///             .await?;
///         step.sleep("pause", "5s").await?;
///         Ok(greeting)
///     }
/// }
/// ```
#[async_trait]
pub trait DurableWorkflow: Send + Sync + 'static {
    /// Unique type identifier, used to look up the definition during replay.
    const TYPE: &'static str;

    /// Payload type. Deserialization doubles as input validation.
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Result type when the workflow completes.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Events, update schemas, retry defaults and result budget.
    fn config() -> WorkflowConfig {
        WorkflowConfig::default()
    }

    /// The workflow body.
    async fn run(
        &self,
        step: &mut StepContext,
        payload: Self::Input,
        live: &LiveContext,
    ) -> RunResult<Self::Output>;
}
