//! Error types for the image service
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Service Error Enum ==
/// Unified error type for the image service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Image, task or cache entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation conflicts with the current state of a resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not permitted (reserved properties)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Database schema is not at a usable version
    #[error("Schema error: {0}")]
    Schema(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite failure in the registry or the cache index
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns true for errors caused by a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Store(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Schema(_)
            | ServiceError::Database(_)
            | ServiceError::Io(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the image service.
pub type Result<T> = std::result::Result<T, ServiceError>;
