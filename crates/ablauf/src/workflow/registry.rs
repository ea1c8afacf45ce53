//! Workflow registry for type-erased definitions
//!
//! The runner only knows workflow types by name; the registry erases the
//! concrete `DurableWorkflow` type behind a JSON-in/JSON-out interface so
//! replay can instantiate and drive any registered definition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::definition::{DurableWorkflow, WorkflowConfig};
use crate::error::{EngineError, ErrorCode, ErrorSource};
use crate::interrupt::{RunError, RunResult};
use crate::live::LiveContext;
use crate::retry::{ResultSizeLimit, RetryPolicy};
use crate::schema::Schema;
use crate::step::StepContext;

/// Type-erased workflow definition.
///
/// All payloads and results are JSON at this boundary; typed conversion
/// happens inside `run`, where a mismatch surfaces as a validation error.
#[async_trait]
pub(crate) trait AnyDefinition: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn event_schema(&self, event: &str) -> Option<&Schema>;

    fn event_schemas(&self) -> &HashMap<String, Schema>;

    fn update_schemas(&self) -> &HashMap<String, Schema>;

    fn has_updates(&self) -> bool;

    fn retries(&self) -> &RetryPolicy;

    fn result_limit(&self) -> &ResultSizeLimit;

    /// Check a payload against the input type without running anything.
    fn validate_payload(&self, payload: &Value) -> Result<(), EngineError>;

    async fn run(
        &self,
        step: &mut StepContext,
        payload: Value,
        live: &LiveContext,
    ) -> RunResult<Value>;
}

struct DefinitionEntry<W: DurableWorkflow> {
    workflow: W,
    config: WorkflowConfig,
}

#[async_trait]
impl<W: DurableWorkflow> AnyDefinition for DefinitionEntry<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn event_schema(&self, event: &str) -> Option<&Schema> {
        self.config.events.get(event)
    }

    fn event_schemas(&self) -> &HashMap<String, Schema> {
        &self.config.events
    }

    fn update_schemas(&self) -> &HashMap<String, Schema> {
        &self.config.updates
    }

    fn has_updates(&self) -> bool {
        !self.config.updates.is_empty()
    }

    fn retries(&self) -> &RetryPolicy {
        &self.config.retries
    }

    fn result_limit(&self) -> &ResultSizeLimit {
        &self.config.result_limit
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), EngineError> {
        serde_json::from_value::<W::Input>(payload.clone())
            .map(|_| ())
            .map_err(|e| {
                EngineError::validation(format!(
                    "invalid payload for workflow type {:?}: {e}",
                    W::TYPE
                ))
            })
    }

    async fn run(
        &self,
        step: &mut StepContext,
        payload: Value,
        live: &LiveContext,
    ) -> RunResult<Value> {
        let input: W::Input = serde_json::from_value(payload).map_err(|e| {
            RunError::Fail(EngineError::validation(format!(
                "invalid payload for workflow type {:?}: {e}",
                W::TYPE
            )))
        })?;

        let output = self.workflow.run(step, input, live).await?;

        serde_json::to_value(output).map_err(|e| {
            RunError::Fail(EngineError::internal(format!(
                "failed to encode result of workflow type {:?}: {e}",
                W::TYPE
            )))
        })
    }
}

/// Registry of workflow definitions, keyed by type name.
#[derive(Default)]
pub struct Registry {
    definitions: HashMap<String, Arc<dyn AnyDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition.
    ///
    /// Fails fast when the type is already registered or when any declared
    /// event/update schema is malformed; the error names the offending
    /// schema node path.
    pub fn register<W: DurableWorkflow>(&mut self, workflow: W) -> Result<(), EngineError> {
        if self.definitions.contains_key(W::TYPE) {
            return Err(EngineError::new(
                ErrorCode::WorkflowAlreadyExists,
                format!("workflow type {:?} is already registered", W::TYPE),
                409,
                ErrorSource::Engine,
            ));
        }

        let config = W::config();
        for (name, schema) in config.events.iter() {
            schema.check().map_err(|e| {
                EngineError::validation(format!(
                    "event {name:?} of workflow type {:?}: {e}",
                    W::TYPE
                ))
            })?;
        }
        for (name, schema) in config.updates.iter() {
            schema.check().map_err(|e| {
                EngineError::validation(format!(
                    "update {name:?} of workflow type {:?}: {e}",
                    W::TYPE
                ))
            })?;
        }

        self.definitions.insert(
            W::TYPE.to_string(),
            Arc::new(DefinitionEntry { workflow, config }),
        );
        Ok(())
    }

    pub(crate) fn get(&self, workflow_type: &str) -> Option<Arc<dyn AnyDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// All registered workflow type names.
    pub fn workflow_types(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflow_types", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Backoff, RetryPolicy};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoInput {
        value: i32,
    }

    struct Echo;

    #[async_trait]
    impl DurableWorkflow for Echo {
        const TYPE: &'static str = "echo";
        type Input = EchoInput;
        type Output = i32;

        fn config() -> WorkflowConfig {
            WorkflowConfig::new()
                .with_event("nudge", Schema::object([("value", Schema::Int)]))
                .with_retries(RetryPolicy::new(2, "100ms", Backoff::Fixed).unwrap())
        }

        async fn run(
            &self,
            _step: &mut StepContext,
            payload: Self::Input,
            _live: &LiveContext,
        ) -> RunResult<Self::Output> {
            Ok(payload.value)
        }
    }

    struct BadSchema;

    #[async_trait]
    impl DurableWorkflow for BadSchema {
        const TYPE: &'static str = "bad_schema";
        type Input = EchoInput;
        type Output = i32;

        fn config() -> WorkflowConfig {
            WorkflowConfig::new().with_event("broken", Schema::object([("cb", Schema::Union(vec![]))]))
        }

        async fn run(
            &self,
            _step: &mut StepContext,
            _payload: Self::Input,
            _live: &LiveContext,
        ) -> RunResult<Self::Output> {
            Ok(0)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(Echo).unwrap();

        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let def = registry.get("echo").unwrap();
        assert_eq!(def.workflow_type(), "echo");
        assert_eq!(def.retries().limit, 2);
        assert!(def.event_schema("nudge").is_some());
        assert!(def.event_schema("other").is_none());
        assert!(!def.has_updates());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = Registry::new();
        registry.register(Echo).unwrap();

        let err = registry.register(Echo).unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkflowAlreadyExists);
    }

    #[test]
    fn test_malformed_schema_rejected_with_path() {
        let mut registry = Registry::new();
        let err = registry.register(BadSchema).unwrap_err();

        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("root.cb"));
        assert!(!registry.contains("bad_schema"));
    }

    #[test]
    fn test_validate_payload() {
        let mut registry = Registry::new();
        registry.register(Echo).unwrap();
        let def = registry.get("echo").unwrap();

        assert!(def.validate_payload(&json!({ "value": 7 })).is_ok());

        let err = def.validate_payload(&json!({ "value": "x" })).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("echo"));
    }
}
