//! Error types for transfer construction and file addressing.

use thiserror::Error;

/// Primary error type for transfer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Transfer or file geometry cannot be mapped onto chunks.
    #[error("invalid transfer geometry: {reason}")]
    InvalidGeometry {
        /// Machine-readable reason for the rejection.
        reason: &'static str,
    },
    /// A file index did not name a file of the transfer.
    #[error("file index {index} out of range ({file_count} files)")]
    FileIndexOutOfRange {
        /// Requested file index.
        index: u32,
        /// Number of files the transfer owns.
        file_count: usize,
    },
    /// Raw bitset bytes were too short for the requested chunk count.
    #[error("bitset needs {expected_bytes} bytes, got {actual_bytes}")]
    BitSetTooShort {
        /// Bytes required to hold every chunk bit.
        expected_bytes: usize,
        /// Bytes supplied by the caller.
        actual_bytes: usize,
    },
}

/// Convenience alias for transfer operation results.
pub type TransferResult<T> = Result<T, TransferError>;
