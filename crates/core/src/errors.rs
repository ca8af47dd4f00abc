//! Error taxonomy for the sync engine.

use thiserror::Error;

use crate::entities::EntityKind;
use crate::sync::{FailureKind, SyncRetryClass};

/// Result type alias used across the core crate and its implementors.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for every engine operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Webhook rejected: {0}")]
    Webhook(#[from] WebhookError),

    /// Error response from the platform API.
    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network-level failure talking to the platform API.
    #[error("Platform API transport error: {0}")]
    Transport(String),

    /// Platform quota exhausted. Callers pause rather than fail.
    #[error("Rate limited by platform API, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing or rejected API credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Retries exhausted after {attempts} attempts: {message}")]
    ExhaustedRetry { attempts: u32, message: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Storage-layer failures, already classified by the storage implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    /// Timeout, lock contention or a busy database.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// A parent row the write depends on is not mirrored yet.
    #[error("missing parent {parent_kind} '{parent_external_id}': {message}")]
    Referential {
        parent_kind: EntityKind,
        parent_external_id: String,
        message: String,
    },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Payload does not conform to the expected entity shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} field '{field}': {reason}")]
pub struct MappingError {
    pub kind: EntityKind,
    pub field: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(kind: EntityKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(kind: EntityKind, field: impl Into<String>) -> Self {
        Self::new(kind, field, "required field is missing")
    }
}

/// Reasons an inbound webhook request is turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    /// Signature missing or mismatched.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// No webhook secret is configured for the addressed store.
    #[error("unknown store '{0}'")]
    UnknownStore(String),

    #[error("event is {age_secs}s old, staleness window is {window_secs}s")]
    Stale { age_secs: i64, window_secs: i64 },

    #[error("event is dated {ahead_secs}s ahead, allowed clock skew is {skew_secs}s")]
    FromFuture { ahead_secs: i64, skew_secs: i64 },

    #[error("malformed webhook body: {0}")]
    Malformed(String),
}

impl WebhookError {
    /// Signature and store failures are authentication errors.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Signature(_) | Self::UnknownStore(_))
    }
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::Transient(message.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::Internal(message.into()))
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Database(DatabaseError::Transient(_))
            | Self::Database(DatabaseError::Referential { .. }) => SyncRetryClass::Retryable,
            Self::Database(_) => SyncRetryClass::Permanent,
            Self::Mapping(_) | Self::Webhook(_) => SyncRetryClass::Permanent,
            Self::Api { status, .. } => crate::sync::classify_http_status(*status),
            Self::Transport(_) | Self::RateLimited { .. } | Self::Timeout(_) => {
                SyncRetryClass::Retryable
            }
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
            Self::ExhaustedRetry { .. }
            | Self::Cancelled(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidInput(_) => SyncRetryClass::Permanent,
        }
    }

    /// Failure category recorded on a failed reconcile attempt.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Database(DatabaseError::Transient(_)) | Self::Timeout(_) => {
                FailureKind::TransientStorage
            }
            Self::Database(DatabaseError::Referential { .. }) => FailureKind::Referential,
            Self::Mapping(_) => FailureKind::Mapping,
            Self::Webhook(err) if err.is_auth() => FailureKind::Auth,
            Self::Auth(_) => FailureKind::Auth,
            Self::RateLimited { .. } => FailureKind::RateLimit,
            Self::ExhaustedRetry { .. } => FailureKind::ExhaustedRetry,
            _ => FailureKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class() == SyncRetryClass::Retryable
    }
}
