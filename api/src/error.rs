use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use learnloop_core::error::{self, ApiError, LearningError};

use crate::store::StoreError;

/// Internal error type that converts to the `{success:false, error, message}` envelope
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Unknown agent, session or experiment (404)
    NotFound { resource: String },
    /// Engine error, status depends on the variant
    Learning(LearningError),
    /// Storage error (500)
    Store(StoreError),
    /// Internal error (500)
    Internal(String),
}

fn envelope(
    code: &str,
    message: String,
    field: Option<String>,
    received: Option<serde_json::Value>,
    docs_hint: Option<String>,
) -> ApiError {
    ApiError {
        success: false,
        error: code.to_string(),
        message,
        field,
        received,
        request_id: uuid::Uuid::now_v7().to_string(),
        docs_hint,
    }
}

fn internal() -> ApiError {
    envelope(
        error::codes::INTERNAL_ERROR,
        "An internal error occurred".to_string(),
        None,
        None,
        None,
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                envelope(
                    error::codes::VALIDATION_ERROR,
                    message,
                    field,
                    received,
                    docs_hint,
                ),
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                envelope(
                    error::codes::NOT_FOUND,
                    format!("{resource} not found"),
                    None,
                    None,
                    None,
                ),
            ),
            AppError::Learning(err) => learning_response(err),
            AppError::Store(err) => {
                tracing::error!(error = %err, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, internal())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, internal())
            }
        };

        (status, Json(api_error)).into_response()
    }
}

fn learning_response(err: LearningError) -> (StatusCode, ApiError) {
    let code = err.code();
    match err {
        LearningError::Validation { message, field } => (
            StatusCode::BAD_REQUEST,
            envelope(code, message, field, None, None),
        ),
        LearningError::PolicyDenied(reason) => (
            StatusCode::CONFLICT,
            envelope(
                code,
                reason.describe().to_string(),
                None,
                None,
                Some(
                    "Check GET /learning/policy and the agent's active session before retrying."
                        .to_string(),
                ),
            ),
        ),
        LearningError::NotFound { resource } => (
            StatusCode::NOT_FOUND,
            envelope(code, format!("{resource} not found"), None, None, None),
        ),
        err @ (LearningError::InvalidTransition { .. }
        | LearningError::ApprovalExists { .. }
        | LearningError::ConcurrencyConflict { .. }) => (
            StatusCode::CONFLICT,
            envelope(code, err.to_string(), None, None, None),
        ),
        err @ (LearningError::Storage(_) | LearningError::Internal(_)) => {
            tracing::error!(error = %err, "engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, internal())
        }
        err => (
            StatusCode::UNPROCESSABLE_ENTITY,
            envelope(code, err.to_string(), None, None, None),
        ),
    }
}

impl From<LearningError> for AppError {
    fn from(err: LearningError) -> Self {
        AppError::Learning(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use learnloop_core::error::DenialReason;

    use super::*;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        (
            status,
            serde_json::from_slice(&bytes).expect("body should be json"),
        )
    }

    #[tokio::test]
    async fn policy_denial_uses_reason_as_error_code() {
        let (status, body) = body_of(AppError::Learning(LearningError::PolicyDenied(
            DenialReason::AlreadyActiveSession,
        )))
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "AlreadyActiveSession");
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let (status, body) =
            body_of(AppError::Learning(LearningError::Storage("pool timed out".into()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "InternalError");
        assert_eq!(body["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn validation_carries_field() {
        let (status, body) = body_of(AppError::Learning(LearningError::validation(
            "triggerReason must not be empty",
            "triggerReason",
        )))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(body["field"], "triggerReason");
    }
}
