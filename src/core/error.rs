//! Error types for the sanitizer core.
//!
//! Internally everything propagates `StripError` with `?`; at the `Stripper`
//! trait boundary errors are logged and collapsed into the boolean results
//! the capability contract requires.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for sanitizer operations.
pub type StripResult<T> = Result<T, StripError>;

/// Errors that can occur while inspecting or sanitizing a file.
#[derive(Debug, Error)]
pub enum StripError {
    /// The specified path does not exist.
    #[error("Path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// The path exists but is not a regular file.
    #[error("Expected a regular file: {0}")]
    NotAFile(PathBuf),

    /// The source must be replaced but may not be written to.
    #[error("Source file is not writable: {0}")]
    NotWritable(PathBuf),

    /// The container library rejected the file.
    #[error("Corrupt container '{path}': {reason}")]
    Container { path: PathBuf, reason: String },

    /// An archive entry path would escape the extraction directory.
    #[error("Entry '{entry}' in '{archive}' escapes the extraction directory")]
    UnsafeEntry { archive: PathBuf, entry: String },

    /// A nested stripper failed; the parent rebuild is aborted.
    #[error("Failed to sanitize entry '{entry}' from '{archive}'")]
    EntryFailed { archive: PathBuf, entry: String },

    /// The sanitized output could not replace the source.
    #[error("Failed to publish sanitized output for '{path}': {reason}")]
    Publish { path: PathBuf, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StripError {
    /// Creates a new corrupt-container error.
    pub fn container(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Container {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new unsafe-entry error.
    pub fn unsafe_entry(archive: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self::UnsafeEntry {
            archive: archive.into(),
            entry: entry.into(),
        }
    }

    /// Creates a new nested-failure error.
    pub fn entry_failed(archive: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self::EntryFailed {
            archive: archive.into(),
            entry: entry.into(),
        }
    }

    /// Creates a new publication error.
    pub fn publish(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Publish {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
