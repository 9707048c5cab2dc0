//! Common error types for the provider directory

use thiserror::Error;

/// Common result type for provider directory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the engine and its tooling
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input record or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (serialization, corrupt stored values)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error came from a uniqueness or foreign-key violation in the store
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => {
                db_err.is_unique_violation() || db_err.is_foreign_key_violation()
            }
            _ => false,
        }
    }

    /// True when the store itself is unreachable (pool closed, connection lost)
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(
            self,
            Error::Database(
                sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
            )
        )
    }
}
