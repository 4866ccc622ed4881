//! Error types for the runtable storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed request: bad column name, bad type, filter shape violation,
    /// incomparable operands, bad range bounds. Raised before any mutation or
    /// partial read is performed; safe to retry after fixing the request.
    #[error("validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// WAL or snapshot I/O failure. Fatal to the triggering mutation; the
    /// in-memory state is left untouched.
    #[error("durability error: {0}")]
    Durability(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl StoreError {
    /// Shorthand for a validation error naming the offending field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
