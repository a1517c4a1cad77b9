use thiserror::Error;

/// Errors raised by record store and collaborator implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing reader failed (I/O, index, deserialization).
    #[error("Reader failure: {0}")]
    Reader(String),

    /// A query could not be executed.
    #[error("Query failure: {0}")]
    Query(String),

    /// The requested model is not part of the schema.
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

impl StorageError {
    pub fn reader(message: impl Into<String>) -> Self {
        Self::Reader(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }
}

/// Type alias for storage results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
