//! Error types shared across Ensemble modules

use thiserror::Error;

/// Errors from common-layer facilities (configuration, database bootstrap).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration resolution errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or migration errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the common Error
pub type Result<T> = std::result::Result<T, Error>;
