use lnchat_shared::ChatError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("{0} not found")]
    NotFound(String),

    /// A unique index rejected the write.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The write would break a model invariant.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A JSON column could not be (de)serialized.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store was closed.
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Busy/locked errors that are worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

/// Map a rusqlite error, turning unique-constraint failures into
/// [`StoreError::AlreadyExists`] for `what`.
pub(crate) fn unique_violation(err: rusqlite::Error, what: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
            return StoreError::AlreadyExists(what.to_string());
        }
    }
    StoreError::Sqlite(err)
}

/// Map `QueryReturnedNoRows` onto [`StoreError::NotFound`].
pub(crate) fn not_found(err: rusqlite::Error, what: &str) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what.to_string()),
        other => StoreError::Sqlite(other),
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ChatError::not_found(format!("{what} not found")),
            StoreError::AlreadyExists(what) => {
                ChatError::already_exists(format!("{what} already exists"))
            }
            StoreError::Invariant(what) => ChatError::invalid_argument(what),
            StoreError::Closed => ChatError::cancelled(),
            other => ChatError::internal("store failure").with_source(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
