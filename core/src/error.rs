use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::session::SessionStatus;

/// Failure envelope returned by every learning endpoint.
///
/// Callers check `success` rather than the HTTP status. `error` is a
/// machine-readable code (e.g. "AlreadyActiveSession"), `message` is the
/// human-readable explanation the dashboard surfaces directly.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Always false
    pub success: bool,
    /// Machine-readable error code
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_ERROR: &str = "ValidationError";
    pub const NOT_FOUND: &str = "NotFound";
    pub const ALREADY_ACTIVE_SESSION: &str = "AlreadyActiveSession";
    pub const POLICY_DISABLED: &str = "PolicyDisabled";
    pub const POLICY_PAUSED: &str = "PolicyPaused";
    pub const TRIGGER_DISABLED: &str = "TriggerDisabled";
    pub const INSUFFICIENT_DATA: &str = "InsufficientData";
    pub const COMPONENT_TIMEOUT: &str = "ComponentTimeout";
    pub const EXTERNAL_DEPENDENCY_ERROR: &str = "ExternalDependencyError";
    pub const CONCURRENCY_CONFLICT: &str = "ConcurrencyConflict";
    pub const INVALID_TRANSITION: &str = "InvalidTransition";
    pub const APPROVAL_EXISTS: &str = "ApprovalExists";
    pub const CANCELLED: &str = "Cancelled";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const RATE_LIMITED: &str = "RateLimited";
}

/// Why the policy engine refused to admit a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum DenialReason {
    AlreadyActiveSession,
    PolicyDisabled,
    PolicyPaused,
    TriggerDisabled,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::AlreadyActiveSession => codes::ALREADY_ACTIVE_SESSION,
            DenialReason::PolicyDisabled => codes::POLICY_DISABLED,
            DenialReason::PolicyPaused => codes::POLICY_PAUSED,
            DenialReason::TriggerDisabled => codes::TRIGGER_DISABLED,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            DenialReason::AlreadyActiveSession => {
                "The agent already has an active learning session"
            }
            DenialReason::PolicyDisabled => "Learning is disabled for this agent",
            DenialReason::PolicyPaused => "Learning is paused for this agent",
            DenialReason::TriggerDisabled => "This trigger type is disabled by the agent's policy",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Engine error taxonomy shared by every component of a learning cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LearningError {
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
    #[error("{}", .0.describe())]
    PolicyDenied(DenialReason),
    #[error("insufficient data: {run_count} eligible runs, {minimum} required")]
    InsufficientData { run_count: usize, minimum: usize },
    #[error("stage {stage} exceeded its dwell budget")]
    ComponentTimeout { stage: SessionStatus },
    #[error("external dependency failed: {0}")]
    ExternalDependency(String),
    #[error("session {session_id} is being advanced by another trigger")]
    ConcurrencyConflict { session_id: Uuid },
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session {session_id} already has an approval decision")]
    ApprovalExists { session_id: Uuid },
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("session cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Internal(String),
}

impl LearningError {
    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        LearningError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LearningError::Validation { .. } => codes::VALIDATION_ERROR,
            LearningError::PolicyDenied(reason) => reason.code(),
            LearningError::InsufficientData { .. } => codes::INSUFFICIENT_DATA,
            LearningError::ComponentTimeout { .. } => codes::COMPONENT_TIMEOUT,
            LearningError::ExternalDependency(_) => codes::EXTERNAL_DEPENDENCY_ERROR,
            LearningError::ConcurrencyConflict { .. } => codes::CONCURRENCY_CONFLICT,
            LearningError::InvalidTransition { .. } => codes::INVALID_TRANSITION,
            LearningError::ApprovalExists { .. } => codes::APPROVAL_EXISTS,
            LearningError::NotFound { .. } => codes::NOT_FOUND,
            LearningError::Cancelled => codes::CANCELLED,
            LearningError::Storage(_) | LearningError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Only external dependency failures are retried; everything else is
    /// surfaced or recorded on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LearningError::ExternalDependency(_))
    }

    /// Text recorded into `metadata.failureReason` when this error fails a session.
    pub fn failure_reason(&self) -> String {
        match self {
            LearningError::InsufficientData { .. } => "insufficient data".to_string(),
            LearningError::ComponentTimeout { stage } => {
                format!("stage {} timed out", stage.as_str())
            }
            other => other.to_string(),
        }
    }
}
