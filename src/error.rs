//! Error types for catalog-sync
//!
//! This module provides the error taxonomy for the library:
//! - `Error` - the top-level error type surfaced to callers
//! - `DownloadError` - transport and validation failures while fetching artifacts
//! - `StorageError` - persistent store failures, including benign natural-key conflicts
//!
//! Any uncaught error inside a stage is fatal to the whole pipeline run. The one
//! exception is [`StorageError::Conflict`], which save stages recover from locally
//! by re-fetching the record a concurrent writer created first.

use thiserror::Error;

/// Result type alias for catalog-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for catalog-sync
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed declarative unit (bad relative path, unsaved content where a
    /// persisted identity is required, etc.). Always fatal to the run.
    #[error("validation error: {0}")]
    Validation(String),

    /// Artifact fetch failed after the retry layer gave up
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Persistent store operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The first fatal error raised by any stage of a pipeline run
    #[error("pipeline stage '{stage}' failed: {source}")]
    Pipeline {
        /// Name of the stage that raised the root-cause error
        stage: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// A stage was cancelled because a sibling stage failed first
    #[error("stage '{stage}' cancelled")]
    Cancelled {
        /// Name of the cancelled stage
        stage: String,
    },

    /// A content future was dropped without being resolved (the pipeline run
    /// failed before the unit reached the resolution stage)
    #[error("content future dropped before resolution")]
    FutureDropped,

    /// A spawned stage task panicked or was aborted unexpectedly
    #[error("stage task failed: {0}")]
    Task(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Download-related errors
///
/// Carries enough context (url, HTTP status where applicable) for a failed
/// synchronization to report a useful root cause.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport-level failure (connect, timeout, stream interruption)
    #[error("transport error fetching {url}: {message}")]
    Transport {
        /// The url that was being fetched
        url: String,
        /// Description of the transport failure
        message: String,
    },

    /// The server answered with a non-success HTTP status
    #[error("{url} returned HTTP {http_status}")]
    Status {
        /// The url that was being fetched
        url: String,
        /// The HTTP status code returned
        http_status: u16,
    },

    /// Downloaded size did not match the expected size
    #[error("size mismatch for {url}: expected {expected}, got {actual}")]
    SizeMismatch {
        /// The url that was fetched
        url: String,
        /// Size the catalog declared
        expected: u64,
        /// Size actually received
        actual: u64,
    },

    /// A declared digest did not match the downloaded bytes
    #[error("{algorithm} digest mismatch for {url}")]
    DigestMismatch {
        /// The url that was fetched
        url: String,
        /// The digest algorithm that failed validation
        algorithm: &'static str,
    },
}

/// Persistent store errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// A concurrent writer already created a record with the same natural key.
    /// Save stages recover from this by re-fetching; it is never surfaced to
    /// the caller of a pipeline run.
    #[error("natural key conflict: {key}")]
    Conflict {
        /// Display form of the conflicting natural key
        key: String,
    },

    /// Record not found where one was required
    #[error("record not found: {0}")]
    NotFound(String),

    /// Backend failure (connection lost, constraint other than natural key, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl Error {
    /// True for the benign natural-key race that save stages handle in place.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Conflict { .. }))
    }
}
