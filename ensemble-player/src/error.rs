//! Error types for ensemble-player
//!
//! Module-specific error types using thiserror for clear propagation.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Media file missing or disabled
    #[error("Media file unavailable: id {0}")]
    MediaUnavailable(u32),

    /// Transcoder setup or decode errors
    #[error("Transcode error: {0}")]
    Transcode(String),

    /// Nothing in the queue could be opened
    #[error("Could not open any file in the queue")]
    QueueExhausted,

    /// Queue is empty
    #[error("Nothing to play")]
    QueueEmpty,

    /// Monotonic clock or playback timer failure
    #[error("Playback clock error: {0}")]
    Clock(String),

    /// Local audio sink errors
    #[error("Local audio error: {0}")]
    LocalAudio(String),

    /// One or more outputs failed to start/stop
    #[error("Output operation failed")]
    OutputFailed,

    /// A selected device requires a password we do not have
    ///
    /// Non-fatal: other outputs in the same operation may have been
    /// activated and are left running.
    #[error("Device requires a password")]
    PasswordRequired,

    /// Invalid state for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument from the control frontend
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The player thread is gone
    #[error("Player is shut down")]
    Shutdown,

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the ensemble-player Error
pub type Result<T> = std::result::Result<T, Error>;
