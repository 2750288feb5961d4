//! Error taxonomy for the HTTP surface.
//!
//! Executor-internal failures (adapter errors, emit failures) never travel
//! through this type; they are contained within the run and surface as
//! `system.error` events plus a `failed` status. Only request-path errors
//! reach HTTP: validation (400), missing resources (404), conflicting run
//! state (400), and store failures (500).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request; never reaches the executor.
    #[error("{0}")]
    Validation(String),

    /// Run, hierarchy, or event stream missing.
    #[error("{0}")]
    NotFound(String),

    /// Operation is illegal in the resource's current state.
    #[error("{0}")]
    Conflict(String),

    /// Store failure on the request path.
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "success": false,
            "code": status.as_u16(),
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
