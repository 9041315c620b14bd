// synckairos: Error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// SyncKairos result type
pub type SyncKairosResult<T> = Result<T, SyncKairosError>;

/// Error taxonomy, matching spec §7.
#[derive(Debug, Error, Clone)]
pub enum SyncKairosError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("operation not allowed in current state: {0}")]
    InvalidState(String),

    #[error("concurrent modification: expected version {expected}, found {found}")]
    ConcurrentModification { expected: u64, found: u64 },

    #[error("participant {0} not found")]
    ParticipantNotFound(Uuid),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("audit enqueue failed: {0}")]
    AuditEnqueueFailed(String),

    #[error("stored state could not be deserialized: {0}")]
    StateDeserialization(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncKairosError {
    /// Stable machine-readable error code, used in the response envelope
    /// and as the basis for HTTP status mapping.
    pub fn code(&self) -> &'static str {
        match self {
            SyncKairosError::Validation(_) => "VALIDATION",
            SyncKairosError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SyncKairosError::InvalidState(_) => "INVALID_STATE",
            SyncKairosError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            SyncKairosError::ParticipantNotFound(_) => "PARTICIPANT_NOT_FOUND",
            SyncKairosError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SyncKairosError::AuditEnqueueFailed(_) => "AUDIT_ENQUEUE_FAILED",
            SyncKairosError::StateDeserialization(_) => "STATE_DESERIALIZATION",
            SyncKairosError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            SyncKairosError::Timeout => "TIMEOUT",
            SyncKairosError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a caller should retry this error, per spec §7's table.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SyncKairosError::ConcurrentModification { .. }
                | SyncKairosError::StoreUnavailable(_)
                | SyncKairosError::RateLimitExceeded(_)
        )
    }

    fn http_status(&self) -> StatusCode {
        match self {
            SyncKairosError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncKairosError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SyncKairosError::InvalidState(_) => StatusCode::CONFLICT,
            SyncKairosError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            SyncKairosError::ParticipantNotFound(_) => StatusCode::BAD_REQUEST,
            SyncKairosError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncKairosError::AuditEnqueueFailed(_) => StatusCode::OK, // never fails the request
            SyncKairosError::StateDeserialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncKairosError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            SyncKairosError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SyncKairosError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire-format error envelope: `{ error: { code, message, correlation_id, retryable } }`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub correlation_id: Uuid,
    pub retryable: bool,
}

impl SyncKairosError {
    pub fn into_response_with_correlation(self, correlation_id: Uuid) -> Response {
        let status = self.http_status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                correlation_id,
                retryable: self.retryable(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for SyncKairosError {
    fn into_response(self) -> Response {
        self.into_response_with_correlation(Uuid::new_v4())
    }
}

impl From<redis::RedisError> for SyncKairosError {
    fn from(err: redis::RedisError) -> Self {
        SyncKairosError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for SyncKairosError {
    fn from(err: sqlx::Error) -> Self {
        SyncKairosError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for SyncKairosError {
    fn from(err: serde_json::Error) -> Self {
        SyncKairosError::StateDeserialization(err.to_string())
    }
}
