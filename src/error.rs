use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the conversation subsystem.
///
/// Only `Validation` surfaces to callers of the public entry points; the
/// other variants are absorbed into conversation-visible fallback messages
/// or logged no-ops so a misbehaving integration never corrupts state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    StateConflict(String),
    #[error("provider call failed: {0}")]
    Provider(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            EngineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            // Absorbed variants should not reach the HTTP layer; if one does,
            // answer with a generic failure rather than leaking internals.
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
