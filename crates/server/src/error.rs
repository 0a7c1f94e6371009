// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::registry::RegistryError;
use crate::supervisor::SupervisorError;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::ProjectNotFound(id) => {
                tracing::warn!(project_id = %id, "Project not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Project not found", format!("Project ID: {}", id)),
                )
            }
            ApiError::Unauthorized(err) => {
                tracing::debug!(error = %err, "Rejected request");
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorResponse::with_details("Unauthorized", err.to_string()),
                )
            }
            ApiError::Supervisor(err) => {
                let (status, message) = match err {
                    SupervisorError::ProjectNotFound(_) => (StatusCode::NOT_FOUND, "Project not found"),
                    SupervisorError::AlreadyRunning { .. } => (StatusCode::CONFLICT, "Process already running"),
                    SupervisorError::CommandNotFound => (StatusCode::BAD_REQUEST, "Loop script not found"),
                    SupervisorError::InvalidInjection => (StatusCode::BAD_REQUEST, "Invalid injection"),
                    SupervisorError::ConfigParse(_) => (StatusCode::BAD_REQUEST, "Invalid loop config"),
                    SupervisorError::ConfigValidation(_) => (StatusCode::BAD_REQUEST, "Invalid loop config"),
                    SupervisorError::OwnProcess => (StatusCode::CONFLICT, "Refusing to signal own process"),
                    SupervisorError::Spawn { .. } | SupervisorError::Io { .. } | SupervisorError::Signal(_) => {
                        tracing::error!(error = %err, "Process control failed");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Process control failed")
                    }
                };
                (status, ErrorResponse::with_details(message, err.to_string()))
            }
            ApiError::Registry(err) => {
                let (status, message) = match err {
                    RegistryError::Invalid(_) => (StatusCode::BAD_REQUEST, "Invalid project path"),
                    RegistryError::Io { .. } | RegistryError::Serialize(_) => {
                        tracing::error!(error = %err, "Registry storage failed");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Registry storage failed")
                    }
                };
                (status, ErrorResponse::with_details(message, err.to_string()))
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("Internal server error", msg.clone()),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn extract_error_response(response: Response) -> (StatusCode, ErrorResponse) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error_response: ErrorResponse = serde_json::from_slice(&body).unwrap();
        (status, error_response)
    }

    #[tokio::test]
    async fn test_project_not_found_response() {
        let response = ApiError::ProjectNotFound("demo-abc123".to_string()).into_response();
        let (status, body) = extract_error_response(response).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Project not found");
        assert!(body.details.unwrap().contains("demo-abc123"));
    }

    #[tokio::test]
    async fn test_supervisor_error_status_codes() {
        let cases = [
            (SupervisorError::AlreadyRunning { pid: 7 }, StatusCode::CONFLICT),
            (SupervisorError::CommandNotFound, StatusCode::BAD_REQUEST),
            (SupervisorError::InvalidInjection, StatusCode::BAD_REQUEST),
            (
                SupervisorError::ProjectNotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_unauthorized_response() {
        let response = ApiError::from(AuthError::MissingToken).into_response();
        let (status, body) = extract_error_response(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, "Unauthorized");
    }

    #[test]
    fn test_error_response_skips_empty_details() {
        let json = serde_json::to_string(&ErrorResponse::new("Oops")).unwrap();
        assert_eq!(json, r#"{"error":"Oops"}"#);
    }
}
