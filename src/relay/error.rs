//! Relay-path error types.
//!
//! One enum for every failure the dispatcher can surface. Transient
//! upstream errors never reach the client while the retry loop is live;
//! whatever terminal error remains is serialized in the dialect the
//! request arrived in.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use super::context::Dialect;

#[derive(Debug, Clone)]
pub enum RelayError {
    /// Missing or malformed credential.
    AuthInvalid(String),
    TokenDisabled,
    TokenExpired,
    TokenExhausted,
    /// Client IP outside the token's subnet.
    SubnetDenied,
    /// Valid token, disallowed action (e.g. selector without admin role).
    Forbidden(String),
    /// A pinned channel does not exist or cannot serve the model.
    ChannelNotFound(String),
    /// No eligible channel in the group (or its backup).
    NoChannel(String),
    QuotaExceeded(String),
    BadRequest(String),
    /// Upstream failure the retry loop may re-route.
    UpstreamRetryable { status: u16, message: String },
    /// Upstream failure that must surface as-is.
    UpstreamFatal { status: u16, message: String },
    /// Deadline hit with retries still available.
    RetryTimeout,
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::AuthInvalid(msg) => write!(f, "invalid credential: {}", msg),
            RelayError::TokenDisabled => write!(f, "token is disabled"),
            RelayError::TokenExpired => write!(f, "token has expired"),
            RelayError::TokenExhausted => write!(f, "token quota is exhausted"),
            RelayError::SubnetDenied => write!(f, "client IP is outside the allowed subnet"),
            RelayError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            RelayError::ChannelNotFound(msg) => write!(f, "channel not found: {}", msg),
            RelayError::NoChannel(msg) => write!(f, "no available channel: {}", msg),
            RelayError::QuotaExceeded(msg) => write!(f, "quota exceeded: {}", msg),
            RelayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            RelayError::UpstreamRetryable { status, message }
            | RelayError::UpstreamFatal { status, message } => {
                write!(f, "upstream error ({}): {}", status, message)
            }
            RelayError::RetryTimeout => {
                write!(f, "retry deadline exceeded, upstreams are saturated")
            }
            RelayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            RelayError::TokenDisabled
            | RelayError::TokenExpired
            | RelayError::TokenExhausted
            | RelayError::SubnetDenied
            | RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::ChannelNotFound(_) | RelayError::NoChannel(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::QuotaExceeded(_) | RelayError::RetryTimeout => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamRetryable { status, .. }
            | RelayError::UpstreamFatal { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code used in the OpenAI error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::AuthInvalid(_) => "invalid_api_key",
            RelayError::TokenDisabled => "token_disabled",
            RelayError::TokenExpired => "token_expired",
            RelayError::TokenExhausted => "token_exhausted",
            RelayError::SubnetDenied => "subnet_denied",
            RelayError::Forbidden(_) => "forbidden",
            RelayError::ChannelNotFound(_) => "channel_not_found",
            RelayError::NoChannel(_) => "no_available_channel",
            RelayError::QuotaExceeded(_) => "insufficient_quota",
            RelayError::BadRequest(_) => "invalid_request",
            RelayError::UpstreamRetryable { .. } | RelayError::UpstreamFatal { .. } => {
                "upstream_error"
            }
            RelayError::RetryTimeout => "retry_timeout",
            RelayError::Internal(_) => "internal_error",
        }
    }

    fn openai_type(&self) -> &'static str {
        match self {
            RelayError::AuthInvalid(_) => "authentication_error",
            RelayError::TokenDisabled
            | RelayError::TokenExpired
            | RelayError::TokenExhausted
            | RelayError::SubnetDenied
            | RelayError::Forbidden(_) => "permission_error",
            RelayError::BadRequest(_) => "invalid_request_error",
            RelayError::QuotaExceeded(_) => "insufficient_quota",
            _ => "relayhub_error",
        }
    }

    /// Whether the dispatcher may re-enter routing after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::UpstreamRetryable { .. } => true,
            _ => false,
        }
    }

    /// Serialize in the arrival dialect's native error shape.
    pub fn into_dialect_response(self, dialect: Dialect) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        crate::logger::error(
            "relay",
            &format!(
                "terminal error: dialect={}, status={}, code={}, message={}",
                dialect,
                status.as_u16(),
                self.code(),
                message
            ),
        );

        let body = match dialect {
            Dialect::OpenAI => json!({
                "error": {
                    "message": message,
                    "type": self.openai_type(),
                    "param": null,
                    "code": self.code(),
                }
            }),
            Dialect::Claude => json!({
                "type": "error",
                "error": {
                    "type": claude_error_type(status),
                    "message": message,
                }
            }),
            Dialect::Gemini => json!({
                "error": {
                    "code": status.as_u16(),
                    "message": message,
                    "status": gemini_status(status),
                }
            }),
            Dialect::Midjourney => json!({
                "code": 4,
                "description": message,
                "result": "",
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.into_dialect_response(Dialect::OpenAI)
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 | 503 => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
