//! The stable error taxonomy shared by every component of the pipeline.
//!
//! Mirrors the shape of a small hand-rolled API error type: one enum of
//! wire-stable codes, a single struct that carries one plus a message and
//! optional cause/metadata, and a narrow `retryable()` predicate that every
//! retry/breaker combinator in the workspace consults instead of matching
//! on error internals itself.

use std::fmt;

use serde::Serialize;

/// Stable, wire-visible error codes. Renaming a variant is a breaking API
/// change for clients, so these intentionally don't track internal error
/// causes one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    ValidationFailed,
    PreconditionFailed,
    ConsistencyError,
    ChecksumMismatch,
    EncryptionError,
    TransientAdapterError,
    PermanentAdapterError,
    Timeout,
    Unknown,
}

impl ErrorCode {
    /// Whether callers should retry an operation that failed with this code.
    /// Transient adapter failures and timeouts are retryable by default;
    /// everything else is a permanent outcome that short-circuits retries.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCode::TransientAdapterError | ErrorCode::Timeout)
    }

    /// Whether a failure of this kind should be logged at `warn` (client-ish,
    /// 4xx-shaped) rather than `error` (server-ish, 5xx-shaped).
    pub fn is_client_fault(self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound
                | ErrorCode::Conflict
                | ErrorCode::Unauthorized
                | ErrorCode::Forbidden
                | ErrorCode::QuotaExceeded
                | ErrorCode::ValidationFailed
                | ErrorCode::PreconditionFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// The error type threaded through every component in the pipeline.
#[derive(Debug)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    pub metadata: serde_json::Value,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientAdapterError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// Emit this error at the appropriate log level. Called once at the
    /// point an error becomes terminal (a response is sent, a tick ends),
    /// never at every propagation hop.
    pub fn log(&self, request_id: &str) {
        if self.code.is_client_fault() {
            tracing::warn!(code = %self.code, request_id, error = %self.message, "request failed");
        } else {
            tracing::error!(code = %self.code, request_id, error = %self.message, cause = ?self.cause, "request failed");
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::RowNotFound => ErrorCode::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    ErrorCode::Conflict
                } else if db_err.code().as_deref() == Some("40001")
                    || db_err.code().as_deref() == Some("40P01")
                {
                    // serialization_failure / deadlock_detected
                    ErrorCode::TransientAdapterError
                } else {
                    ErrorCode::PermanentAdapterError
                }
            }
            sqlx::Error::PoolTimedOut => ErrorCode::Timeout,
            sqlx::Error::Io(_) => ErrorCode::TransientAdapterError,
            _ => ErrorCode::PermanentAdapterError,
        };
        Error::new(code, err.to_string()).with_cause(err)
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() {
            ErrorCode::TransientAdapterError
        } else {
            ErrorCode::PermanentAdapterError
        };
        Error::new(code, err.to_string()).with_cause(err)
    }
}

/// Wire body for `{code, message, details?, requestId}`, with an optional
/// `retryAfterMs` for rate-limit responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Error {
    /// Rate-limit errors carry `retryAfterMs` in `metadata`; lifted to its
    /// own top-level wire field here rather than nested under `details`, per
    /// the error response schema.
    pub fn to_body(&self, request_id: impl Into<String>) -> ErrorBody {
        let retry_after_ms = self
            .metadata
            .get("retryAfterMs")
            .and_then(serde_json::Value::as_u64);

        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            details: self.metadata.clone(),
            request_id: request_id.into(),
            retry_after_ms,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::PreconditionFailed => StatusCode::CONFLICT,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorCode::ConsistencyError | ErrorCode::ChecksumMismatch => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::EncryptionError => StatusCode::BAD_REQUEST,
            ErrorCode::TransientAdapterError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::PermanentAdapterError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        self.log(&request_id);
        let body = self.to_body(request_id);

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(ErrorCode::TransientAdapterError.retryable());
        assert!(ErrorCode::Timeout.retryable());
        assert!(!ErrorCode::ValidationFailed.retryable());
        assert!(!ErrorCode::PermanentAdapterError.retryable());
    }

    #[test]
    fn client_fault_classification() {
        assert!(ErrorCode::NotFound.is_client_fault());
        assert!(ErrorCode::Forbidden.is_client_fault());
        assert!(!ErrorCode::TransientAdapterError.is_client_fault());
        assert!(!ErrorCode::Unknown.is_client_fault());
    }

    #[test]
    fn quota_exceeded_lifts_retry_after_ms_to_top_level() {
        let err = Error::new(ErrorCode::QuotaExceeded, "rate limit exceeded")
            .with_metadata(serde_json::json!({"retryAfterMs": 4200}));
        let body = err.to_body("req-456");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["retryAfterMs"], 4200);
        assert_eq!(json["details"]["retryAfterMs"], 4200);
    }

    #[test]
    fn error_body_serializes_expected_shape() {
        let err = Error::not_found("conversation c1 not found")
            .with_metadata(serde_json::json!({"namespace": "messages"}));
        let body = err.to_body("req-123");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["requestId"], "req-123");
        assert_eq!(json["details"]["namespace"], "messages");
    }
}
