//! Error types for download execution.
//!
//! Variants carry the context (URL, path, sizes) needed for logging and for
//! classification by the retry policy.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionError;

/// Errors that can occur while executing a download task.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The descriptor failed pre-flight validation (missing or unsafe URL,
    /// illegal target path).
    #[error("validation failed for post {post_id}: {reason}")]
    Validation {
        /// Post id the task was created for.
        post_id: String,
        /// Short cause.
        reason: String,
    },

    /// Transport failure from the shared session.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The server answered with an unexpected status.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// Asset URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// A redirect was offered; redirects are refused on asset transfers.
    #[error("redirect ({status}) refused downloading {url}")]
    Redirect {
        /// Asset URL.
        url: String,
        /// The 3xx status code.
        status: u16,
    },

    /// Filesystem failure while writing or renaming.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The stream ended short of, or overran, the declared length.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, observed {actual_bytes}"
    )]
    Integrity {
        /// Partial file involved.
        path: PathBuf,
        /// Declared total.
        expected_bytes: u64,
        /// Observed bytes.
        actual_bytes: u64,
    },

    /// The disk guard refused the transfer.
    #[error("disk guard: {reason}")]
    DiskGuard {
        /// Which limit tripped.
        reason: String,
    },

    /// The task was cancelled cooperatively.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Reason recorded on the token.
        reason: String,
    },

    /// Retry budget exhausted; wraps the final attempt's message.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },
}

impl DownloadError {
    /// Creates a validation error.
    pub fn validation(post_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            post_id: post_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a refused-redirect error.
    pub fn redirect(url: impl Into<String>, status: u16) -> Self {
        Self::Redirect {
            url: url.into(),
            status,
        }
    }

    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a disk guard refusal.
    pub fn disk_guard(reason: impl Into<String>) -> Self {
        Self::DiskGuard {
            reason: reason.into(),
        }
    }

    /// Creates a cancellation error from a token reason.
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::Cancelled {
            reason: reason.unwrap_or_else(|| "cancelled".to_string()),
        }
    }
}
