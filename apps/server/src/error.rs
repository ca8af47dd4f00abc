use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use salla_mirror_core::errors::{DatabaseError, Error, WebhookError};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: "bad_request",
            message: message.into(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest { code, .. } => (StatusCode::BAD_REQUEST, *code),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("API error ({}): {}", status, self);
        }
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Signature(_) | WebhookError::UnknownStore(_) => {
                Self::Unauthorized(err.to_string())
            }
            WebhookError::Stale { .. } | WebhookError::FromFuture { .. } => Self::BadRequest {
                code: "stale_event",
                message: err.to_string(),
            },
            WebhookError::Malformed(_) => Self::BadRequest {
                code: "malformed_event",
                message: err.to_string(),
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Webhook(err) => err.into(),
            Error::Database(DatabaseError::NotFound(message)) => Self::NotFound(message),
            Error::Database(DatabaseError::Transient(message)) | Error::Timeout(message) => {
                Self::Unavailable(message)
            }
            Error::InvalidInput(message) => Self::bad_request(message),
            Error::Auth(message) => Self::Unauthorized(message),
            other => Self::Internal(other.to_string()),
        }
    }
}
