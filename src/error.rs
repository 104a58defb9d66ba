use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Speed test already in progress")]
    SpeedTestInProgress,

    #[error("Invalid server target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::SpeedTestInProgress => StatusCode::CONFLICT,
            EngineError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
