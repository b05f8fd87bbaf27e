//! Common error types for strata

use thiserror::Error;

/// Common result type for strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the strata crates
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

    /// Requested entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// True for transient SQLite lock contention (`SQLITE_BUSY` and friends)
pub fn is_lock_error(err: &sqlx::Error) -> bool {
    let msg = err.to_string();
    msg.contains("database is locked") || msg.contains("database table is locked")
}

impl Error {
    /// True for transient SQLite lock contention
    pub fn is_database_locked(&self) -> bool {
        match self {
            Error::Database(db_err) => is_lock_error(db_err),
            _ => false,
        }
    }

    /// True when a unique index rejected an insert
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}
