//! Error types for the segment store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in segment store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Archive layer error.
    #[error("storage error: {0}")]
    Storage(#[from] arbordb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A referenced segment is not present in any reader or the writer.
    ///
    /// Fatal for the reading operation; surfaced to the caller.
    #[error("segment not found: {id}")]
    SegmentNotFound {
        /// Textual form of the missing segment id.
        id: String,
    },

    /// A segment or record failed to decode: bad magic, bad alignment, or
    /// an inconsistent header.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The store directory lock is held by another process.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A `set_head` compare-and-set lost against a concurrent commit.
    ///
    /// Recoverable: rebase the changes onto the new head and retry.
    #[error("commit conflict: the head moved concurrently")]
    CommitConflict,

    /// Compaction or estimation was cancelled. Non-fatal; reported to the
    /// GC monitor.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// What interrupted the operation.
        reason: String,
    },

    /// The disk-space probe reported insufficient free space.
    #[error("disk space low")]
    DiskSpaceLow,

    /// A mutating operation was attempted on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// A record id string could not be parsed.
    #[error("invalid record id: {text}")]
    InvalidRecordId {
        /// The rejected input.
        text: String,
    },
}

impl Error {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates a segment-not-found error.
    pub fn segment_not_found(id: impl ToString) -> Self {
        Self::SegmentNotFound {
            id: id.to_string(),
        }
    }

    /// Creates an invalid-record-id error.
    pub fn invalid_record_id(text: impl Into<String>) -> Self {
        Self::InvalidRecordId { text: text.into() }
    }
}
