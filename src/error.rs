//! Error taxonomy for the conversion run.
//!
//! Every variant names the path or URL it concerns so that a failed run can
//! be diagnosed from the message alone. None of these errors are retried.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for all conversion operations.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ========== Source Errors ==========
    /// Download failed (connection, non-success status, interrupted body).
    #[error("download of {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// Archive is corrupt or of an unsupported kind.
    #[error("cannot extract {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// Archive member does not exist.
    #[error("archive member not found: {path}")]
    NotFound { path: PathBuf },

    /// Archive member does not follow the batch layout.
    #[error("malformed archive member {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    // ========== Output Errors ==========
    /// Filesystem failure while writing, closing or cleaning up.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A container frame failed its checksum or was truncated.
    #[error("corrupt record in {path} at offset {offset}: {reason}")]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    // ========== Setup Errors ==========
    /// Dataset layout or options are inconsistent.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl ConvertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConvertError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ConvertError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ConvertError::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure came from the input side of the run
    /// (download, archive, or member contents) rather than from writing output.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            ConvertError::Network { .. }
                | ConvertError::Extraction { .. }
                | ConvertError::NotFound { .. }
                | ConvertError::Format { .. }
        )
    }
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;
