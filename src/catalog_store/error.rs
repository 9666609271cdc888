use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the catalog storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An insert hit a uniqueness constraint; the conflicting row already exists.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The connection is no longer inside the import transaction.
    #[error("Import transaction is no longer active")]
    TransactionAborted,

    #[error("Database error: {0}")]
    Sqlite(#[source] rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi_err, msg) = &err {
            if ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return StoreError::UniqueViolation(
                    msg.clone().unwrap_or_else(|| "unique constraint".to_string()),
                );
            }
        }
        StoreError::Sqlite(err)
    }
}

impl StoreError {
    /// Whether this error leaves the surrounding transaction unusable.
    ///
    /// Constraint and type errors only roll back the failing statement. I/O, lock,
    /// corruption and resource errors may make SQLite roll back the whole
    /// transaction, so nothing after them can be trusted.
    pub fn is_transaction_fatal(&self) -> bool {
        match self {
            StoreError::UniqueViolation(_) => false,
            StoreError::TransactionAborted => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(ffi_err, _)) => matches!(
                ffi_err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::OutOfMemory
                    | ErrorCode::ReadOnly
                    | ErrorCode::OperationInterrupted
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
            ),
            StoreError::Sqlite(_) => false,
        }
    }
}
