use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RowPulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed alert, subscription or filter parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown database, alert or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// A notification channel failed to deliver (or timed out)
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl RowPulseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RowPulseError::NotFound(_))
    }
}
