use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Why a single upstream connection ended. None of these are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("tenant has no upstream credential configured")]
    MissingCredential,
    #[error("upstream rejected the connection with status {0}")]
    Rejected(u16),
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unterminated line buffer reached {buffered} bytes (limit {limit})")]
    LineBufferOverflow { buffered: usize, limit: usize },
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "internal error");
        Self::internal("Internal server error")
    }
}

pub type AppResult<T> = Result<T, AppError>;
