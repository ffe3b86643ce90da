//! Crate-wide error type shared by every transport (HTTP, gRPC, internal).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors surfaced across the control plane and worker.
///
/// One enum maps onto both HTTP status codes and gRPC `tonic::Status`
/// codes, so the mapping is written once.
#[derive(Debug, thiserror::Error)]
pub enum OpenSandboxError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("gone: {0}")]
    Gone(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OpenSandboxError>;

impl OpenSandboxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OpenSandboxError::Validation(_) => StatusCode::BAD_REQUEST,
            OpenSandboxError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OpenSandboxError::Forbidden(_) => StatusCode::FORBIDDEN,
            OpenSandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            OpenSandboxError::Conflict(_) => StatusCode::CONFLICT,
            OpenSandboxError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            OpenSandboxError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            // 502 is reserved for proxy.rs's own connect/forward failures.
            OpenSandboxError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OpenSandboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OpenSandboxError::Gone(_) => StatusCode::GONE,
            OpenSandboxError::Storage(_) | OpenSandboxError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the caller may safely retry the same request.
    pub fn retry_allowed(&self) -> bool {
        matches!(
            self,
            OpenSandboxError::WorkerUnavailable(_) | OpenSandboxError::Timeout(_)
        )
    }

    /// The caller-facing message, without the variant-name prefix `Display`
    /// adds for logs. This is what reaches the wire in `{"error": ...}`
    /// bodies — e.g. a `Quota` error reads `"concurrent sandbox limit
    /// reached"`, not `"quota exceeded: concurrent sandbox limit reached"`.
    pub fn message(&self) -> &str {
        match self {
            OpenSandboxError::Validation(m)
            | OpenSandboxError::Unauthorized(m)
            | OpenSandboxError::Forbidden(m)
            | OpenSandboxError::NotFound(m)
            | OpenSandboxError::Conflict(m)
            | OpenSandboxError::Quota(m)
            | OpenSandboxError::WorkerUnavailable(m)
            | OpenSandboxError::Upstream(m)
            | OpenSandboxError::Timeout(m)
            | OpenSandboxError::Gone(m)
            | OpenSandboxError::Storage(m)
            | OpenSandboxError::Internal(m) => m,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for OpenSandboxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for OpenSandboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OpenSandboxError::NotFound("row not found".into()),
            other => OpenSandboxError::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for OpenSandboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OpenSandboxError::Timeout(err.to_string())
        } else {
            OpenSandboxError::Upstream(err.to_string())
        }
    }
}

impl From<OpenSandboxError> for tonic::Status {
    fn from(err: OpenSandboxError) -> Self {
        let code = match &err {
            OpenSandboxError::Validation(_) => tonic::Code::InvalidArgument,
            OpenSandboxError::Unauthorized(_) => tonic::Code::Unauthenticated,
            OpenSandboxError::Forbidden(_) => tonic::Code::PermissionDenied,
            OpenSandboxError::NotFound(_) => tonic::Code::NotFound,
            OpenSandboxError::Conflict(_) => tonic::Code::AlreadyExists,
            OpenSandboxError::Quota(_) => tonic::Code::ResourceExhausted,
            OpenSandboxError::WorkerUnavailable(_) => tonic::Code::Unavailable,
            OpenSandboxError::Upstream(_) => tonic::Code::Aborted,
            OpenSandboxError::Timeout(_) => tonic::Code::DeadlineExceeded,
            OpenSandboxError::Gone(_) => tonic::Code::NotFound,
            OpenSandboxError::Storage(_) | OpenSandboxError::Internal(_) => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}

impl From<tonic::Status> for OpenSandboxError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::InvalidArgument => OpenSandboxError::Validation(status.message().into()),
            tonic::Code::Unauthenticated => {
                OpenSandboxError::Unauthorized(status.message().into())
            }
            tonic::Code::PermissionDenied => OpenSandboxError::Forbidden(status.message().into()),
            tonic::Code::NotFound => OpenSandboxError::NotFound(status.message().into()),
            tonic::Code::AlreadyExists => OpenSandboxError::Conflict(status.message().into()),
            tonic::Code::ResourceExhausted => OpenSandboxError::Quota(status.message().into()),
            tonic::Code::Unavailable => {
                OpenSandboxError::WorkerUnavailable(status.message().into())
            }
            tonic::Code::DeadlineExceeded => OpenSandboxError::Timeout(status.message().into()),
            _ => OpenSandboxError::Upstream(status.message().into()),
        }
    }
}

impl From<tonic::transport::Error> for OpenSandboxError {
    fn from(err: tonic::transport::Error) -> Self {
        OpenSandboxError::WorkerUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(OpenSandboxError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(OpenSandboxError::Unauthorized("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(OpenSandboxError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(OpenSandboxError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(OpenSandboxError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(OpenSandboxError::Quota("x".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(OpenSandboxError::WorkerUnavailable("x".into()).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(OpenSandboxError::Upstream("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(OpenSandboxError::Timeout("x".into()).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(OpenSandboxError::Gone("x".into()).status_code(), StatusCode::GONE);
        assert_eq!(OpenSandboxError::Storage("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(OpenSandboxError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(OpenSandboxError::WorkerUnavailable("x".into()).retry_allowed());
        assert!(OpenSandboxError::Timeout("x".into()).retry_allowed());
        assert!(!OpenSandboxError::Validation("x".into()).retry_allowed());
        assert!(!OpenSandboxError::NotFound("x".into()).retry_allowed());
    }

    #[test]
    fn tonic_status_round_trips_preserve_variant_class() {
        let original = OpenSandboxError::NotFound("sandbox sbx-1".into());
        let status: tonic::Status = OpenSandboxError::NotFound("sandbox sbx-1".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        let back: OpenSandboxError = status.into();
        assert!(matches!(back, OpenSandboxError::NotFound(_)));
        assert_eq!(original.to_string(), back.to_string());
    }

    #[test]
    fn gone_maps_to_not_found_over_grpc_since_there_is_no_gone_code() {
        let status: tonic::Status = OpenSandboxError::Gone("sandbox sbx-1".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn quota_error_body_has_no_variant_prefix() {
        let err = OpenSandboxError::Quota("concurrent sandbox limit reached".into());
        assert_eq!(err.message(), "concurrent sandbox limit reached");
        assert!(err.to_string().starts_with("quota exceeded:"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "concurrent sandbox limit reached");
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found_variant() {
        let err: OpenSandboxError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, OpenSandboxError::NotFound(_)));
    }
}
