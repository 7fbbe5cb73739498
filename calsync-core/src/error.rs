//! Error taxonomy shared by every calsync layer.
//!
//! Storage errors are translated into this taxonomy at the repository
//! boundary; nothing above the repositories sees a raw `rusqlite::Error`.

/// Result type for calsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by repositories and the synchronization backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Referenced user, calendar or event is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violated on create
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Fingerprint mismatch, or an existence assertion did not hold
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Missing or contradictory required fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed path or document
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Storage or transaction failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a lower-layer failure as `Internal` with some context.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Internal(format!("{}: {}", context, err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("database error: {}", err))
    }
}

/// True when `err` is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// True when `err` is a FOREIGN KEY constraint violation.
pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
