//! Unified error handling for the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::Error;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Service(#[from] Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Service(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            AppError::Service(e) => match e {
                Error::NotFound { .. }
                | Error::Engine(rollcall_engine::Error::MutationNotFound(_)) => {
                    StatusCode::NOT_FOUND
                }
                Error::Engine(_) | Error::ModeUnavailable(_) => StatusCode::CONFLICT,
                Error::Remote(_) => StatusCode::BAD_GATEWAY,
                Error::Storage(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = if status.is_server_error() {
            tracing::error!("Request failed: {:?}", self);
            ("Internal server error".to_string(), Some(self.to_string()))
        } else {
            tracing::warn!("Request rejected: {}", self);
            (self.to_string(), None)
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use rollcall_engine::EntityType;

    #[test]
    fn status_mapping() {
        let not_found = AppError::from(Error::NotFound {
            entity_type: EntityType::Student,
            id: "S1".into(),
        });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = AppError::from(Error::Engine(rollcall_engine::Error::MissingRequiredField(
            "name".into(),
        )));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let storage = AppError::from(Error::Storage(StorageError::Unavailable("disk".into())));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let mode = AppError::from(Error::ModeUnavailable("no remote".into()));
        assert_eq!(mode.status(), StatusCode::CONFLICT);
    }
}
