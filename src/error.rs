//! # Error Taxonomy
//!
//! Tessera classifies every failure into one of the kinds below. Fallible
//! operations return `eyre::Result`; the kind is attached at the failure
//! site with `bail!(StorageError::...)` and context is layered on top with
//! `wrap_err`. Context never converts a kind: callers can always recover
//! the original classification with [`storage_error_kind`] regardless of
//! how many layers of context were added on the way up.
//!
//! ## Recovery Policy
//!
//! - `Cancelled` is terminal; it is never retried internally.
//! - `IOError` is not retried by the core (retry belongs to the VFS layer).
//! - Tile cache insert failures are the only errors swallowed locally; the
//!   cache is advisory.
//! - `InternalError` indicates a broken invariant, i.e. a bug.

use thiserror::Error;

/// Classified storage failures.
///
/// The message carried by each variant names the URI or argument that
/// triggered the failure; callers add operation context via `wrap_err`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("encryption key mismatch: {0}")]
    EncryptionMismatch(String),

    #[error("filelock error: {0}")]
    LockError(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("i/o error: {0}")]
    IOError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal invariant violated: {0}")]
    InternalError(String),
}

impl StorageError {
    /// True when two errors carry the same classification, ignoring the
    /// message payload. Used by callers that branch on kind.
    pub fn same_kind(&self, other: &StorageError) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled(_))
    }
}

/// Recovers the [`StorageError`] kind from a report, looking through any
/// `wrap_err` context layers. Returns `None` for errors that originated
/// outside the taxonomy (e.g. raw `std::io::Error` bubbled by the VFS
/// before classification).
pub fn storage_error_kind(report: &eyre::Report) -> Option<&StorageError> {
    report.downcast_ref::<StorageError>()
}

/// True when the report's root classification matches `kind`.
pub fn is_storage_error(report: &eyre::Report, kind: &StorageError) -> bool {
    storage_error_kind(report).is_some_and(|e| e.same_kind(kind))
}
