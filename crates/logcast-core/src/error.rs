//! Errors raised while checking or reading the monitored file.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a single tail cycle.
///
/// None of these are fatal on their own: the caller logs them and retries
/// from the same baseline on the next change signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TailError {
    /// The file could not be opened
    #[error("Failed to open {path}: {error}")]
    Open { path: PathBuf, error: String },

    /// The file could not be stat'ed
    #[error("Failed to stat {path}: {error}")]
    Stat { path: PathBuf, error: String },

    /// Seeking to the resume offset failed
    #[error("Failed to seek {path} to offset {offset}: {error}")]
    Seek {
        path: PathBuf,
        offset: u64,
        error: String,
    },

    /// Reading forward from the resume offset failed
    #[error("Failed to read {path} at offset {offset}: {error}")]
    Read {
        path: PathBuf,
        offset: u64,
        error: String,
    },

    /// The path exists but is not a regular file
    #[error("{path} is not a regular file")]
    NotAFile { path: PathBuf },
}

/// Result type for tail operations.
pub type TailResult<T> = Result<T, TailError>;
