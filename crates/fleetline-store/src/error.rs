use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error that maps to no more specific variant.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// A unique-key constraint rejected the write. At the session level
    /// this is not a failure: the loser re-fetches the winner's row.
    #[error("Unique constraint violated")]
    UniqueViolation,

    /// A statement referenced a column the backing schema does not
    /// have. Callers retry the logical operation without the optional
    /// field.
    #[error("Missing column: {0}")]
    MissingColumn(String),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Classify raw SQLite failures once, at the crate boundary, so every
/// `?` on a rusqlite result yields the precise variant.
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi_err, ref msg) = e {
            if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation {
                let unique = msg
                    .as_deref()
                    .map(|m| m.contains("UNIQUE") || m.contains("PRIMARY KEY"))
                    .unwrap_or(false);
                if unique {
                    return StoreError::UniqueViolation;
                }
            }
            if let Some(m) = msg.as_deref() {
                if let Some(col) = m.strip_prefix("no such column: ") {
                    return StoreError::MissingColumn(col.to_string());
                }
            }
        }
        StoreError::Sqlite(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
