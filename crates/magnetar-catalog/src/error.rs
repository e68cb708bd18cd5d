use miette::Diagnostic;
use thiserror::Error;

/// Catalog error type
///
/// Variants carry message strings rather than boxed sources so the error
/// stays `Clone`; a single fetch outcome is broadcast to every waiter.
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CatalogError {
    /// Key not found
    #[error("key not found: {bucket}/{key}")]
    #[diagnostic(
        code(magnetar::catalog::key_not_found),
        help("Verify the key exists in the bucket")
    )]
    KeyNotFound { bucket: String, key: String },

    /// Database error
    #[error("database error: {message}")]
    #[diagnostic(
        code(magnetar::catalog::database_error),
        help("Check that the catalog file is accessible and not corrupted")
    )]
    DatabaseError { message: String },

    /// Transaction error
    #[error("transaction error: {message}")]
    #[diagnostic(
        code(magnetar::catalog::transaction_error),
        help("Ensure the transaction has not already been committed or aborted")
    )]
    TransactionError { message: String },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(
        code(magnetar::catalog::serialization_error),
        help("Stored records must be valid JSON for the expected type")
    )]
    SerializationError { message: String },
}

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
    pub fn key_not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::KeyNotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::DatabaseError {
            message: message.into(),
        }
    }

    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl From<redb::Error> for CatalogError {
    fn from(err: redb::Error) -> Self {
        CatalogError::database_error(format!("redb error: {}", err))
    }
}

impl From<redb::DatabaseError> for CatalogError {
    fn from(err: redb::DatabaseError) -> Self {
        CatalogError::database_error(format!("failed to open database: {}", err))
    }
}

impl From<redb::TransactionError> for CatalogError {
    fn from(err: redb::TransactionError) -> Self {
        CatalogError::transaction_error(format!("{}", err))
    }
}

impl From<redb::StorageError> for CatalogError {
    fn from(err: redb::StorageError) -> Self {
        CatalogError::database_error(format!("storage error: {}", err))
    }
}

impl From<redb::TableError> for CatalogError {
    fn from(err: redb::TableError) -> Self {
        CatalogError::database_error(format!("table error: {}", err))
    }
}

impl From<redb::CommitError> for CatalogError {
    fn from(err: redb::CommitError) -> Self {
        CatalogError::transaction_error(format!("commit error: {}", err))
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::serialization_error(format!("JSON error: {}", err))
    }
}
