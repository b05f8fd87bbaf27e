//! Error types for strata-arc
//!
//! Every failure of a store, merge or archiving operation is one of the
//! variants below. The protocol layer that receives objects is expected to
//! translate [`ErrorCategory`] into its own status codes.

use thiserror::Error;

/// Result type for strata-arc operations
pub type ArcResult<T> = std::result::Result<T, ArcError>;

/// Archive error type
#[derive(Debug, Error)]
pub enum ArcError {
    /// Incoming bytes could not be staged (disk full, permissions, timeout)
    #[error("Spool error: {0}")]
    Spool(String),

    /// The dataset is not parseable
    #[error("Parse error: {0}")]
    Parse(String),

    /// A SOP instance with different content already exists and overwrite is not allowed
    #[error("Duplicate instance {sop_iuid}: stored digest differs")]
    DuplicateInstance { sop_iuid: String },

    /// The incoming identifiers belong to more than one persisted subject
    #[error("Identifiers match {} subjects: {subjects:?}", .subjects.len())]
    NonUniqueSubject { subjects: Vec<i64> },

    /// Following merge pointers revisited a subject, or a merge would create a cycle
    #[error("Circular merge involving subject {subject}")]
    CircularMerge { subject: i64 },

    /// The subject was already merged into another one
    #[error("Subject {subject} is already merged into {merged_into}")]
    SubjectMerged { subject: i64, merged_into: i64 },

    /// Storage driver failure (read/write/delete, container packaging)
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Another scheduler instance claimed the task first; never surfaced to operators
    #[error("Task {task_id} already claimed")]
    TaskClaimConflict { task_id: i64 },

    /// An archiving task failed more often than the retry limit allows
    #[error("Task {task_id} failed after {retries} retries: {last_error}")]
    TaskRetryExhausted {
        task_id: i64,
        retries: u32,
        last_error: String,
    },

    /// An I/O step exceeded its configured timeout
    #[error("Timed out after {timeout_ms} ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Missing AE or storage group configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// strata-common error
    #[error("Common error: {0}")]
    Common(#[from] strata_common::Error),
}

/// Coarse error categories reported to the calling protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The object itself was refused (unparseable, duplicate)
    RejectedObject,
    /// The subject could not be resolved unambiguously
    IdentityConflict,
    /// Bytes could not be staged or written
    StorageFailure,
    /// Anything else (database, configuration)
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RejectedObject => "REJECTED_OBJECT",
            ErrorCategory::IdentityConflict => "IDENTITY_CONFLICT",
            ErrorCategory::StorageFailure => "STORAGE_FAILURE",
            ErrorCategory::Internal => "INTERNAL",
        }
    }
}

impl ArcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArcError::Parse(_) | ArcError::DuplicateInstance { .. } => ErrorCategory::RejectedObject,
            ArcError::NonUniqueSubject { .. }
            | ArcError::CircularMerge { .. }
            | ArcError::SubjectMerged { .. } => ErrorCategory::IdentityConflict,
            ArcError::Spool(_)
            | ArcError::StorageIo(_)
            | ArcError::Timeout { .. }
            | ArcError::Io(_) => ErrorCategory::StorageFailure,
            ArcError::TaskClaimConflict { .. }
            | ArcError::TaskRetryExhausted { .. }
            | ArcError::Config(_)
            | ArcError::NotFound(_)
            | ArcError::Database(_)
            | ArcError::Common(_) => ErrorCategory::Internal,
        }
    }

    /// Transient SQLite lock contention, worth retrying the whole transaction
    pub fn is_database_locked(&self) -> bool {
        match self {
            ArcError::Database(e) => strata_common::error::is_lock_error(e),
            ArcError::Common(e) => e.is_database_locked(),
            _ => false,
        }
    }

    /// A unique index rejected an insert (concurrent find-or-create)
    pub fn is_unique_violation(&self) -> bool {
        match self {
            ArcError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            ArcError::Common(e) => e.is_unique_violation(),
            _ => false,
        }
    }
}
