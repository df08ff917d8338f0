//! Error types for the archive layer.

use std::io;
use thiserror::Error;

/// Result type for archive operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the archive layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An archive file is corrupted or invalid.
    #[error("archive corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The reader has been closed by a concurrent cleanup.
    #[error("archive reader is closed")]
    Closed,
}

impl StorageError {
    /// Creates an archive corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}
