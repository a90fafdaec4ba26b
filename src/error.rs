//! Admin-surface error types.
//!
//! The admin API replies with the `{success, message, data?}` envelope at
//! HTTP 200 even on logical failure; transport-level errors (auth, IO)
//! keep their status codes. Relay-path errors live in `relay::error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => {
                crate::logger::error("admin", &format!("database error: {}", e));
                envelope_err("database operation failed")
            }
            AppError::Io(e) => {
                crate::logger::error("admin", &format!("io error: {}", e));
                envelope_err("file operation failed")
            }
            AppError::Json(e) => {
                crate::logger::error("admin", &format!("json error: {}", e));
                envelope_err("data serialization failed")
            }
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"success": false, "message": msg})),
            )
                .into_response(),
            AppError::BadRequest(msg) | AppError::NotFound(msg) => envelope_err(msg),
        }
    }
}

fn envelope_err(message: &str) -> Response {
    Json(json!({"success": false, "message": message})).into_response()
}

pub type AppResult<T> = Result<T, AppError>;
