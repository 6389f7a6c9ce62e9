use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{api::types::ErrorBody, db::DatabaseError, inference::GenerationError};

/// Request-level failures and the status code each one maps to.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("error generating text: {0}")]
    Generation(#[from] GenerationError),
    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmptyPrompt => StatusCode::BAD_REQUEST,
            Self::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Generation(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_client_errors() {
        assert_eq!(AppError::EmptyPrompt.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::InvalidBody("missing field `prompt`".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn backend_errors_are_server_errors() {
        let gen = AppError::from(GenerationError::Model("cuda oom".into()));
        let db = AppError::from(DatabaseError::Query("disk full".into()));
        assert_eq!(gen.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(gen.to_string().contains("cuda oom"));
        assert!(db.to_string().contains("disk full"));
    }
}
