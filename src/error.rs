//! Error types for Strata-DB

use thiserror::Error;

/// Result type alias for Strata-DB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Strata-DB
#[derive(Error, Debug)]
pub enum Error {
    /// Key or object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Conditional write failed because the expected etag did not match
    #[error("precondition failed for key: {0}")]
    PreconditionFailed(String),

    /// The manifest was updated concurrently; the caller must rebase
    #[error("manifest conflict: concurrent update detected")]
    ManifestConflict,

    /// Segment bytes failed validation (magic, checksum, schema, projection)
    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: String, reason: String },

    /// Two operations raced on the same object outside manifest publication
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation is not supported by this backend or configuration
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Operation exceeded its caller-supplied deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when retrying the operation may succeed without caller action.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::ManifestConflict | Error::Io(_) | Error::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Helper for corrupt-segment errors.
    pub fn corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptSegment {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
