//! Engine error envelope
//!
//! Every domain error carries a code from a closed catalogue, an HTTP-like
//! status for transport mapping, and the subsystem it originated from. Errors
//! crossing actor boundaries serialize to a JSON envelope and are
//! reconstructed on the other side by parsing the peer's message field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::StoreError;
use crate::units::UnitParseError;

/// Closed catalogue of engine error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WorkflowNotFound,
    WorkflowAlreadyExists,
    WorkflowTypeUnknown,
    ValidationError,
    StepFailed,
    StepRetryExhausted,
    EventTimeout,
    UpdateTimeout,
    EventInvalid,
    WorkflowNotRunning,
    ResourceNotFound,
    ObservabilityDisabled,
    InternalError,
}

/// Subsystem an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Api,
    Engine,
    Step,
    Validation,
}

/// Structured engine error.
///
/// `Display` prints the message only; use [`EngineError::to_envelope`] for the
/// wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
    pub source: ErrorSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EngineError {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        status: u16,
        source: ErrorSource,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            source,
            details: None,
        }
    }

    /// Attach structured details to the error.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn workflow_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowNotFound,
            format!("workflow {id:?} not found"),
            404,
            ErrorSource::Engine,
        )
    }

    pub fn workflow_already_exists(id: &str, existing_type: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowAlreadyExists,
            format!("workflow {id:?} already exists with type {existing_type:?}"),
            409,
            ErrorSource::Engine,
        )
    }

    pub fn workflow_type_unknown(workflow_type: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowTypeUnknown,
            format!("unknown workflow type {workflow_type:?}"),
            404,
            ErrorSource::Engine,
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message, 400, ErrorSource::Validation)
    }

    pub fn step_failed(step: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::StepFailed,
            format!("step {step:?} failed: {}", message.into()),
            500,
            ErrorSource::Step,
        )
    }

    pub fn step_retry_exhausted(step: &str, attempts: u32, cause: &str) -> Self {
        Self::new(
            ErrorCode::StepRetryExhausted,
            format!("step {step:?} failed after {attempts} attempt(s): {cause}"),
            500,
            ErrorSource::Step,
        )
    }

    pub fn event_timeout(step: &str) -> Self {
        Self::new(
            ErrorCode::EventTimeout,
            format!("timed out waiting for event {step:?}"),
            408,
            ErrorSource::Engine,
        )
    }

    pub fn update_timeout(event: &str) -> Self {
        Self::new(
            ErrorCode::UpdateTimeout,
            format!("timed out waiting for update {event:?}"),
            408,
            ErrorSource::Engine,
        )
    }

    pub fn event_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EventInvalid, message, 400, ErrorSource::Validation)
    }

    pub fn workflow_not_running(id: &str, status: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowNotRunning,
            format!("workflow {id:?} is not running (status: {status})"),
            409,
            ErrorSource::Engine,
        )
    }

    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, message, 404, ErrorSource::Api)
    }

    pub fn observability_disabled() -> Self {
        Self::new(
            ErrorCode::ObservabilityDisabled,
            "no observability provider is configured for this engine",
            501,
            ErrorSource::Engine,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, 500, ErrorSource::Engine)
    }

    /// Serialize to the cross-actor JSON envelope.
    pub fn to_envelope(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Reconstruct an error from a peer's message field.
    ///
    /// Accepts either a JSON envelope produced by [`EngineError::to_envelope`]
    /// or a bare message, which becomes an `INTERNAL_ERROR`.
    pub fn from_transport(message: &str) -> Self {
        serde_json::from_str(message).unwrap_or_else(|_| Self::internal(message))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<UnitParseError> for EngineError {
    fn from(err: UnitParseError) -> Self {
        Self::validation(err.to_string())
    }
}
