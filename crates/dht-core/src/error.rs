//! Error types shared across the storage, server and downloader crates.

use thiserror::Error;

/// Storage backend failure surfaced by repositories.
///
/// Callers see these directly; the HTTP layer maps them to 500, the
/// downloader records them per item. Backend details stay behind a string
/// so no `sqlx` type leaks into a signature.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database failure (SQL error, disk full, corruption).
    #[error("storage error: {0}")]
    Storage(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The pool is closed; no further work is possible.
    #[error("database closed")]
    Closed,
}

/// Failure detected while opening or upgrading the schema.
///
/// All of these leave the database unopened.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The version row is missing semantics: unparsable or below 1.
    #[error("invalid database version: {0}")]
    InvalidDatabaseVersion(String),

    /// The file was written by a newer build of this program.
    #[error("database version {found} is newer than supported version {supported}")]
    DatabaseTooNew { found: u32, supported: u32 },

    /// A migration step failed; the version row still points at `from`.
    #[error("migration from version {from} failed: {message}")]
    MigrationFailed { from: u32, message: String },

    /// Storage failure during schema work.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-item download failure.
///
/// Recorded on the item's row and emitted on the finished stream; never
/// aborts the engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport-level failure (connect, TLS, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("http status {0}")]
    HttpStatus(u16),

    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// Declared or accumulated size exceeded the configured cap.
    #[error("size cap exceeded")]
    SizeCapExceeded,

    /// The engine is stopping; benign, never recorded as a failure.
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_messages_name_the_versions() {
        let err = SchemaError::DatabaseTooNew {
            found: 9,
            supported: 8,
        };
        let text = err.to_string();
        assert!(text.contains('9'));
        assert!(text.contains('8'));
    }

    #[test]
    fn storage_error_converts_into_schema_error() {
        let err: SchemaError = StorageError::Storage("disk full".into()).into();
        assert!(matches!(err, SchemaError::Storage(_)));
    }
}
