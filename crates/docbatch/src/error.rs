//! Error types for the batch engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::FileStatus;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Batch engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument on the control API (e.g. empty file list)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Batch id is not resident in the batch store
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// Illegal file state transition
    #[error("Illegal transition for file {index}: {from} -> {to}")]
    Transition {
        index: usize,
        from: FileStatus,
        to: FileStatus,
    },

    /// Payload could not be encoded/decoded for cross-context transfer
    #[error("Encoding failed for '{filename}': {message}")]
    Encoding { filename: String, message: String },

    /// Extraction service failure
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an encoding error
    pub fn encoding(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encoding {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            Error::BatchNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Transition { .. } => (StatusCode::CONFLICT, "illegal_transition"),
            Error::Encoding { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "encoding_error"),
            Error::Extraction(_) => (StatusCode::BAD_GATEWAY, "extraction_error"),
            Error::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            Error::Json(_) => (StatusCode::BAD_REQUEST, "json_error"),
            Error::Http(_) => (StatusCode::BAD_GATEWAY, "http_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
