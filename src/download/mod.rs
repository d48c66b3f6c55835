//! Resumable HTTP downloads into the content-safe library layout.
//!
//! [`DownloadManager`] registers at most one task per post id, runs each on
//! a bounded worker pool, and publishes lifecycle events. Per-task execution
//! streams with HTTP range resumption, cooperative cancellation, retry with
//! exponential backoff, and disk-space guards; the `.tmp` -> final rename is
//! the sole completion signal on disk.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use booruview_core::config::AppConfig;
//! use booruview_core::download::{DownloadCallbacks, DownloadManager};
//! use booruview_core::events::EventBus;
//! use booruview_core::post::Post;
//! use booruview_core::security::UrlValidator;
//! use booruview_core::session::Session;
//!
//! # fn example(post: Post) -> Option<()> {
//! let config = AppConfig::default();
//! let session = Arc::new(Session::new().ok()?);
//! let validator = Arc::new(UrlValidator::new(
//!     config.allowed_schemes.clone(),
//!     config.allowed_hosts.clone(),
//! ));
//! let manager = DownloadManager::new(&config, session, validator, EventBus::global().clone());
//! let token = manager.submit_download(post, Path::new("./lib"), DownloadCallbacks::default())?;
//! token.cancel("changed my mind");
//! # Some(())
//! # }
//! ```

mod error;
mod manager;
mod retry;
mod transfer;

pub use error::DownloadError;
pub use manager::{
    CompleteCallback, DownloadCallbacks, DownloadManager, DownloadStatus, DownloaderSettings,
    ErrorCallback, ProgressCallback,
};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
