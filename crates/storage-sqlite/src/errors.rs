use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use salla_mirror_core::errors::{DatabaseError, Error};

/// Errors raised by the SQLite layer before they are classified for the engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Query error: {0}")]
    Query(#[from] DieselError),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// SQLite reports lock contention as a generic error with one of these messages.
fn is_busy_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
}

impl From<StorageError> for DatabaseError {
    fn from(err: StorageError) -> Self {
        match err {
            // Pool checkout timeouts mean every connection is busy.
            StorageError::Pool(err) => DatabaseError::Transient(err.to_string()),
            StorageError::Connection(err) => DatabaseError::Internal(err.to_string()),
            StorageError::Migration(message) => DatabaseError::Internal(message),
            StorageError::Query(DieselError::NotFound) => {
                DatabaseError::NotFound("record not found".to_string())
            }
            StorageError::Query(DieselError::DatabaseError(kind, info)) => {
                let message = info.message().to_string();
                match kind {
                    DatabaseErrorKind::UniqueViolation
                    | DatabaseErrorKind::ForeignKeyViolation
                    | DatabaseErrorKind::NotNullViolation
                    | DatabaseErrorKind::CheckViolation => DatabaseError::Constraint(message),
                    _ if is_busy_message(&message) => DatabaseError::Transient(message),
                    _ => DatabaseError::Internal(message),
                }
            }
            StorageError::Query(err) => DatabaseError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Database(err.into())
    }
}
