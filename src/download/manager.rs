//! Download task registration, scheduling, and lifecycle events.
//!
//! The manager owns the active-task map (at most one task per post id), a
//! semaphore-bounded worker pool, and the terminal bookkeeping: every task
//! ends by leaving the map, publishing exactly one of
//! `DOWNLOAD_{COMPLETED, CANCELLED, FAILED}`, and invoking the caller's
//! callback.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::transfer::{self, TransferContext};
use crate::api;
use crate::cancel::CancellationToken;
use crate::config::AppConfig;
use crate::events::{Event, EventBus, EventKind};
use crate::post::{Post, Rating};
use crate::security::UrlValidator;
use crate::session::Session;

/// Progress callback: `(post_id, percent)`.
pub type ProgressCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Completion callback: `(post_id, final_path)`.
pub type CompleteCallback = Arc<dyn Fn(&str, &Path) + Send + Sync>;

/// Error callback: `(post_id, message)`.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Optional per-task callbacks. Callbacks receive plain values, never task
/// handles, and panics inside them are isolated.
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    /// Invoked at most every ~100 ms while streaming, and once with 100.0.
    pub on_progress: Option<ProgressCallback>,
    /// Invoked exactly once on terminal success.
    pub on_complete: Option<CompleteCallback>,
    /// Invoked exactly once on terminal failure or cancellation.
    pub on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Downloader tuning derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct DownloaderSettings {
    /// Concurrent transfer budget.
    pub max_workers: usize,
    /// Attempts per task.
    pub max_retries: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Base backoff delay.
    pub retry_delay: Duration,
    /// Write-buffer capacity in bytes.
    pub chunk_size: usize,
    /// Hard per-file ceiling in bytes.
    pub max_file_bytes: u64,
    /// Minimum free space on the library volume in bytes.
    pub disk_min_free_bytes: u64,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for DownloaderSettings {
    fn from(config: &AppConfig) -> Self {
        // Both the per-download limit and the application-wide ceiling
        // apply; the effective limit is the smaller.
        let max_file_mb = config.download.max_file_mb.min(config.max_file_mb);
        Self {
            max_workers: config.max_download_workers.clamp(1, 10),
            max_retries: config.download.max_retries.max(1),
            timeout: Duration::from_secs(config.download.timeout),
            retry_delay: Duration::from_secs_f64(config.download.retry_delay.max(0.1)),
            chunk_size: config.download.chunk_size.max(1024),
            max_file_bytes: max_file_mb * 1024 * 1024,
            disk_min_free_bytes: (config.download.disk_min_free_gb.max(0.0)
                * 1024.0
                * 1024.0
                * 1024.0) as u64,
        }
    }
}

/// Snapshot of manager counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStatus {
    /// Tasks submitted and not yet terminal.
    pub pending: usize,
    /// Resume lookups currently fetching descriptors.
    pub resuming: usize,
    /// Entries in the active-task map.
    pub active: usize,
    /// Distinct post ids with at least one terminal failure.
    pub failed: usize,
}

struct ActiveTask {
    token: CancellationToken,
}

struct ManagerInner {
    settings: Arc<DownloaderSettings>,
    config: AppConfig,
    session: Arc<Session>,
    validator: Arc<UrlValidator>,
    bus: EventBus,
    semaphore: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveTask>>,
    failed: Mutex<HashMap<String, u32>>,
    pending: AtomicUsize,
    resuming: AtomicUsize,
    shutdown: CancellationToken,
    idle: Notify,
}

/// Concurrent, resumable download manager.
///
/// Cloning is cheap and shares the task map. Exactly one task may exist per
/// post id at any time; a second `submit_download` for the same id returns
/// `None` until the first reaches a terminal state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.get_status();
        f.debug_struct("DownloadManager")
            .field("status", &status)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager over the shared session, validator, and bus.
    #[must_use]
    pub fn new(
        config: &AppConfig,
        session: Arc<Session>,
        validator: Arc<UrlValidator>,
        bus: EventBus,
    ) -> Self {
        let settings = DownloaderSettings::from(config);
        debug!(
            max_workers = settings.max_workers,
            max_retries = settings.max_retries,
            "creating download manager"
        );
        Self {
            inner: Arc::new(ManagerInner {
                semaphore: Arc::new(Semaphore::new(settings.max_workers)),
                settings: Arc::new(settings),
                config: config.clone(),
                session,
                validator,
                bus,
                active: Mutex::new(HashMap::new()),
                failed: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                resuming: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Registers and schedules a download task.
    ///
    /// Returns the task's cancellation token, or `None` when a task for
    /// this post id already exists or the manager is shutting down.
    /// Publishes `DOWNLOAD_STARTED` before scheduling.
    #[instrument(skip(self, post, callbacks), fields(post_id = post.id))]
    pub fn submit_download(
        &self,
        post: Post,
        base_dir: &Path,
        callbacks: DownloadCallbacks,
    ) -> Option<CancellationToken> {
        if self.inner.shutdown.is_cancelled() {
            warn!(post_id = post.id, "rejecting submit after shutdown");
            return None;
        }

        let post_id = post.key();
        let token = CancellationToken::new();
        {
            let mut active = self.lock_active();
            if active.contains_key(&post_id) {
                debug!(post_id = %post_id, "task already exists");
                return None;
            }
            active.insert(
                post_id.clone(),
                ActiveTask {
                    token: token.clone(),
                },
            );
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        self.inner.bus.publish(
            &Event::new(EventKind::DownloadStarted).with("post_id", post_id.clone()),
        );

        let ctx = TransferContext {
            post_id: post_id.clone(),
            post,
            base_dir: base_dir.to_path_buf(),
            token: token.clone(),
            shutdown: self.inner.shutdown.clone(),
            on_progress: callbacks.on_progress.clone(),
            settings: Arc::clone(&self.inner.settings),
            session: Arc::clone(&self.inner.session),
            validator: Arc::clone(&self.inner.validator),
            bus: self.inner.bus.clone(),
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let permit = manager.inner.semaphore.clone().acquire_owned().await;
            let result = match permit {
                Ok(_permit) => transfer::execute(&ctx).await,
                Err(_) => Err(DownloadError::cancelled(Some("worker pool closed".to_string()))),
            };
            manager.finish_task(&ctx, result, &callbacks);
        });

        Some(token)
    }

    /// Fetches the descriptor for `post_id` from the remote API, then
    /// delegates to [`submit_download`](Self::submit_download).
    ///
    /// Used to resume orphan `.tmp` files at startup and to backfill
    /// favorites whose stored record lacks a `file_url`.
    #[instrument(skip(self, callbacks, folder), fields(folder = %folder))]
    pub fn submit_resume(
        &self,
        post_id: &str,
        folder: Rating,
        base_dir: &Path,
        callbacks: DownloadCallbacks,
    ) {
        {
            let active = self.lock_active();
            if active.contains_key(post_id) {
                debug!(post_id, "resume skipped, task already exists");
                return;
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        self.inner.resuming.fetch_add(1, Ordering::SeqCst);
        let manager = self.clone();
        let post_id = post_id.to_string();
        let base_dir = base_dir.to_path_buf();
        tokio::spawn(async move {
            let lookup =
                api::fetch_post_by_id(&manager.inner.session, &manager.inner.config, &post_id)
                    .await;
            match lookup {
                Ok(post) => {
                    // The tmp partial next to the target is detected by the
                    // transfer's resume step automatically.
                    manager.submit_download(post, &base_dir, callbacks);
                }
                Err(err) => {
                    warn!(post_id = %post_id, error = %err, "resume lookup failed");
                    invoke_error_callback(&callbacks, &post_id, &err.to_string());
                }
            }
            manager.inner.resuming.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Cancels one task. Returns whether a task was found.
    pub fn cancel_download(&self, post_id: &str, reason: &str) -> bool {
        let active = self.lock_active();
        if let Some(task) = active.get(post_id) {
            task.token.cancel(reason);
            info!(post_id, reason, "cancellation requested");
            true
        } else {
            false
        }
    }

    /// Cancels every task whose token is not already set.
    ///
    /// Returns how many tokens changed state.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let active = self.lock_active();
        let mut count = 0;
        for task in active.values() {
            if !task.token.is_cancelled() {
                task.token.cancel(reason);
                count += 1;
            }
        }
        info!(count, reason, "cancelled all active downloads");
        count
    }

    /// Counter snapshot.
    #[must_use]
    pub fn get_status(&self) -> DownloadStatus {
        DownloadStatus {
            pending: self.inner.pending.load(Ordering::SeqCst),
            resuming: self.inner.resuming.load(Ordering::SeqCst),
            active: self.lock_active().len(),
            failed: self
                .inner
                .failed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len(),
        }
    }

    /// Sets the shutdown flag, cancels everything, and optionally waits for
    /// the active map to drain (bounded by `timeout`).
    pub async fn shutdown(&self, wait: bool, timeout: Duration) {
        self.inner.shutdown.cancel("shutting down");
        self.cancel_all("shutting down");

        if wait {
            let deadline = tokio::time::Instant::now() + timeout;
            while !self.lock_active().is_empty() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    warn!("shutdown wait timed out with tasks still active");
                    break;
                }
                let notified = self.inner.idle.notified();
                if self.lock_active().is_empty() {
                    break;
                }
                let _ = tokio::time::timeout(remaining.min(Duration::from_millis(100)), notified)
                    .await;
            }
        }
        info!("download manager shut down");
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveTask>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Terminal bookkeeping: leaves the map, publishes exactly one terminal
    /// event, and invokes the user callback.
    fn finish_task(
        &self,
        ctx: &TransferContext,
        result: Result<PathBuf, DownloadError>,
        callbacks: &DownloadCallbacks,
    ) {
        let post_id = &ctx.post_id;
        {
            let mut active = self.lock_active();
            active.remove(post_id);
            if active.is_empty() {
                self.inner.idle.notify_waiters();
            }
        }
        // Balanced with the increment in submit_download; one per task.
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(path) => {
                if let Some(on_complete) = &callbacks.on_complete {
                    let on_complete = Arc::clone(on_complete);
                    if catch_unwind(AssertUnwindSafe(|| on_complete(post_id, &path))).is_err() {
                        warn!(post_id = %post_id, "completion callback panicked");
                    }
                }
                self.inner.bus.publish(
                    &Event::new(EventKind::DownloadCompleted)
                        .with("post_id", post_id.clone())
                        .with("path", path.display().to_string()),
                );
            }
            Err(err) => {
                {
                    let mut failed = self
                        .inner
                        .failed
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    *failed.entry(post_id.clone()).or_insert(0) += 1;
                }
                let message = err.to_string();
                invoke_error_callback(callbacks, post_id, &message);

                let cancelled = matches!(err, DownloadError::Cancelled { .. })
                    || ctx.token.is_cancelled()
                    || ctx.shutdown.is_cancelled();
                let kind = if cancelled {
                    EventKind::DownloadCancelled
                } else {
                    EventKind::DownloadFailed
                };
                warn!(post_id = %post_id, error = %message, cancelled, "download finished with error");
                self.inner.bus.publish(
                    &Event::new(kind)
                        .with("post_id", post_id.clone())
                        .with("error", message),
                );
            }
        }
    }
}

fn invoke_error_callback(callbacks: &DownloadCallbacks, post_id: &str, message: &str) {
    if let Some(on_error) = &callbacks.on_error {
        let on_error = Arc::clone(on_error);
        if catch_unwind(AssertUnwindSafe(|| on_error(post_id, message))).is_err() {
            warn!(post_id, "error callback panicked");
        }
    }
}
