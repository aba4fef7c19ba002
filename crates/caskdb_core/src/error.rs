//! Error types for CaskDB core.

use crate::types::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in CaskDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] caskdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another live writer holds the directory lock.
    #[error("lock held: another writer (pid {pid}) has exclusive access")]
    LockHeld {
        /// Process id recorded in the lock file, 0 if unreadable.
        pid: u32,
    },

    /// A record failed checksum verification or is structurally invalid.
    #[error("corrupt record in segment {segment_id} at offset {offset}: {message}")]
    CorruptRecord {
        /// Segment holding the record.
        segment_id: SegmentId,
        /// Offset of the record header.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected while decoding a buffer.
    ///
    /// Raised by the codec, which has no notion of segments. Segment-aware
    /// callers convert it into [`CoreError::CorruptRecord`].
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// A buffer is too short or declares impossible sizes.
    #[error("malformed record: {message}")]
    Malformed {
        /// Description of the problem.
        message: String,
    },

    /// Segment or offset does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// A merge could not be completed; its output was discarded.
    #[error("merge failed: {message}")]
    MergeFailed {
        /// Reason for the failure.
        message: String,
    },

    /// Open-time recovery exceeded the configured time budget.
    #[error("recovery did not finish within {elapsed_ms} ms")]
    RecoveryTimeout {
        /// Time spent before giving up.
        elapsed_ms: u128,
    },

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument problem.
        message: String,
    },

    /// Configuration rejected by [`crate::Config::validate`].
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,
}

impl CoreError {
    /// Creates a corrupt record error.
    pub fn corrupt_record(segment_id: SegmentId, offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            segment_id,
            offset,
            message: message.into(),
        }
    }

    /// Creates a malformed record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a merge failed error.
    pub fn merge_failed(message: impl Into<String>) -> Self {
        Self::MergeFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Attaches a segment location to codec-level decode failures.
    ///
    /// Checksum and framing errors become [`CoreError::CorruptRecord`];
    /// everything else passes through unchanged.
    #[must_use]
    pub fn at(self, segment_id: SegmentId, offset: u64) -> Self {
        match self {
            Self::ChecksumMismatch { expected, actual } => Self::corrupt_record(
                segment_id,
                offset,
                format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            ),
            Self::Malformed { message } => Self::corrupt_record(segment_id, offset, message),
            other => other,
        }
    }

    /// Returns whether this error reports on-disk corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptRecord { .. } | Self::ChecksumMismatch { .. } | Self::Malformed { .. }
        )
    }
}
