//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`. Errors are rendered as the standard
//! `{code, msg, data}` envelope with a matching HTTP status.
//!
//! Internal failures (database, provider setup) are logged in full but only a generic
//! message reaches the caller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::db::DbError;
use crate::llm::LlmError;
use crate::schemas::BaseResponse;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("model error: {0}")]
    Model(#[from] LlmError),

    /// The requested model has no provider configured.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Database(_)
            | ServerError::Model(_)
            | ServerError::ModelUnavailable(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let client_message = match &self {
            ServerError::NotFound(m) | ServerError::ModelUnavailable(m) => m.clone(),
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                "internal server error".to_owned()
            }
            ServerError::Model(e) => {
                error!(error = %e, "model setup failed");
                "internal server error".to_owned()
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                "internal server error".to_owned()
            }
        };
        let body = BaseResponse::<()>::error(status.as_u16(), client_message);
        (status, Json(body)).into_response()
    }
}
