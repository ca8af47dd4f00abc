//! Error types for the platform API client.

use thiserror::Error;

use salla_mirror_core::errors::Error as CoreError;

pub type Result<T> = std::result::Result<T, SallaApiError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Error)]
pub enum SallaApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the platform.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Quota exhausted; the platform asked us to wait.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or malformed access token.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl SallaApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) | Self::RateLimited { .. } => ApiRetryClass::Retryable,
            Self::Json(_) | Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

impl From<SallaApiError> for CoreError {
    fn from(err: SallaApiError) -> Self {
        match err {
            SallaApiError::Http(err) => CoreError::Transport(err.to_string()),
            SallaApiError::Json(err) => CoreError::Api {
                status: 200,
                message: format!("unreadable response body: {}", err),
            },
            SallaApiError::Api { status, message } if matches!(status, 401 | 403) => {
                CoreError::Auth(format!("platform returned {}: {}", status, message))
            }
            SallaApiError::Api { status, message } => CoreError::Api { status, message },
            SallaApiError::RateLimited { retry_after_secs } => {
                CoreError::RateLimited { retry_after_secs }
            }
            SallaApiError::InvalidRequest(message) => CoreError::InvalidInput(message),
            SallaApiError::Auth(message) => CoreError::Auth(message),
        }
    }
}
