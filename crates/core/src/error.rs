use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Stable, client-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    UnprocessableEntity,
    RateLimited,
    ValidationError,
    AuthenticationError,
    AuthorizationError,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::AuthenticationError => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::AuthorizationError => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict => StatusCode::CONFLICT,
            Self::UnprocessableEntity => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Conflict => "CONFLICT",
            Self::UnprocessableEntity => "UNPROCESSABLE_ENTITY",
            Self::RateLimited => "RATE_LIMITED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::AuthorizationError => "AUTHORIZATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// A single violated validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Unified error type for every request-handling failure.
///
/// Only `public_message()` and `details()` ever reach the client. The
/// `Display` output may contain internal detail and is meant for logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method {method} not allowed")]
    MethodNotAllowed { method: String, allowed: Vec<String> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("validation failed with {} error(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::MethodNotAllowed { .. } => ErrorCode::MethodNotAllowed,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::UnprocessableEntity(_) => ErrorCode::UnprocessableEntity,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Authentication(_) => ErrorCode::AuthenticationError,
            Self::Authorization(_) => ErrorCode::AuthorizationError,
            Self::Internal(_) => ErrorCode::InternalError,
            Self::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status()
    }

    /// Message safe to show to a client. Internal failures never echo their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::UnprocessableEntity(m)
            | Self::Authentication(m)
            | Self::Authorization(m) => m.clone(),
            Self::MethodNotAllowed { method, .. } => format!("Method {method} not allowed"),
            Self::RateLimited { .. } => "Too many requests, please try again later".to_string(),
            Self::Validation(_) => "Request validation failed".to_string(),
            Self::Internal(_) => "An unexpected error occurred".to_string(),
            Self::ServiceUnavailable(_) => "Service temporarily unavailable".to_string(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::MethodNotAllowed { allowed, .. } => Some(json!({ "allowed": allowed })),
            Self::RateLimited { retry_after_secs } => {
                Some(json!({ "retryAfter": retry_after_secs }))
            }
            Self::Validation(errors) => Some(json!({ "errors": errors })),
            _ => None,
        }
    }

    /// Whether the error is an infrastructure failure that must be logged in full.
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    pub fn body(&self, request_id: Option<&str>) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.public_message(),
            details: self.details(),
            request_id: request_id.map(str::to_string),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Serialized `error` object of the error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({
            "success": false,
            "error": self.body(None),
        });
        (
            self.status_code(),
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

/// Failure of a backing store (rate-limit counters, job queue, profiles).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            StoreError::Conflict(_) | StoreError::Unavailable(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_total() {
        let cases = [
            (ErrorCode::BadRequest, 400),
            (ErrorCode::Unauthorized, 401),
            (ErrorCode::Forbidden, 403),
            (ErrorCode::NotFound, 404),
            (ErrorCode::MethodNotAllowed, 405),
            (ErrorCode::Conflict, 409),
            (ErrorCode::UnprocessableEntity, 422),
            (ErrorCode::RateLimited, 429),
            (ErrorCode::ValidationError, 400),
            (ErrorCode::AuthenticationError, 401),
            (ErrorCode::AuthorizationError, 403),
            (ErrorCode::InternalError, 500),
            (ErrorCode::ServiceUnavailable, 503),
        ];
        for (code, status) in cases {
            assert_eq!(code.status().as_u16(), status, "{code:?}");
        }
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let v = serde_json::to_value(ErrorCode::MethodNotAllowed).unwrap();
        assert_eq!(v, "METHOD_NOT_ALLOWED");
        assert_eq!(ErrorCode::RateLimited.as_str(), "RATE_LIMITED");
    }

    #[test]
    fn test_internal_detail_never_public() {
        let err = ApiError::Internal("db password=hunter2 refused".into());
        assert!(!err.public_message().contains("hunter2"));
        let body = serde_json::to_string(&err.body(Some("req-1"))).unwrap();
        assert!(!body.contains("hunter2"));
        assert!(body.contains("req-1"));
    }

    #[test]
    fn test_validation_details_aggregate() {
        let err = ApiError::Validation(vec![
            FieldError::new("name", "is required"),
            FieldError::new("age", "must be an integer"),
        ]);
        let details = err.details().unwrap();
        assert_eq!(details["errors"].as_array().unwrap().len(), 2);
        assert_eq!(details["errors"][0]["field"], "name");
    }

    #[test]
    fn test_method_not_allowed_lists_allowed() {
        let err = ApiError::MethodNotAllowed {
            method: "DELETE".into(),
            allowed: vec!["GET".into(), "POST".into()],
        };
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.details().unwrap()["allowed"][1], "POST");
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound("job".into()).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err: ApiError = StoreError::Unavailable("timeout".into()).into();
        assert_eq!(err.code(), ErrorCode::InternalError);
    }
}
