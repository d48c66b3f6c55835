//! Per-task download execution: a small state machine with byte-accurate
//! resume.
//!
//! `Validate -> Plan -> Attempt* -> Terminate`. Each attempt prepares a
//! `Range` header from the on-disk partial, streams into `{target}.tmp`,
//! verifies against `Content-Length`, and renames on success. The rename is
//! the sole completion signal on disk; partials are left in place on every
//! failure path so a later run can resume them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::manager::{DownloaderSettings, ProgressCallback};
use crate::cancel::CancellationToken;
use crate::events::{Event, EventBus, EventKind};
use crate::post::Post;
use crate::security::{self, UrlValidator};
use crate::session::{Session, SessionError};

/// Bytes past `Content-Length` tolerated before the stream is aborted.
const OVERRUN_SLACK: u64 = 5 * 1024;

/// Minimum interval between progress notifications.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum sanitized filename length for library files.
const MAX_FILENAME_LEN: usize = 200;

/// Maximum tag characters carried into the filename.
const MAX_TAG_LEN: usize = 50;

/// Everything one transfer needs; owned so the task is self-contained.
pub(crate) struct TransferContext {
    pub post_id: String,
    pub post: Post,
    pub base_dir: PathBuf,
    pub token: CancellationToken,
    pub shutdown: CancellationToken,
    pub on_progress: Option<ProgressCallback>,
    pub settings: Arc<DownloaderSettings>,
    pub session: Arc<Session>,
    pub validator: Arc<UrlValidator>,
    pub bus: EventBus,
}

impl TransferContext {
    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if self.token.is_cancelled() {
            return Err(DownloadError::cancelled(self.token.reason()));
        }
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::cancelled(
                self.shutdown.reason().or_else(|| Some("shutdown".to_string())),
            ));
        }
        Ok(())
    }

    fn report_progress(&self, percent: f64) {
        if let Some(callback) = &self.on_progress {
            let callback = Arc::clone(callback);
            let post_id = self.post_id.clone();
            // User callbacks may panic; isolate them.
            if catch_unwind(AssertUnwindSafe(|| callback(&post_id, percent))).is_err() {
                warn!(post_id = %self.post_id, "progress callback panicked");
            }
        }
        self.bus.publish(
            &Event::new(EventKind::DownloadProgress)
                .with("post_id", self.post_id.clone())
                .with("percent", percent),
        );
    }
}

/// Runs the full state machine and returns the final file path.
pub(crate) async fn execute(ctx: &TransferContext) -> Result<PathBuf, DownloadError> {
    // Validate
    let url = ctx
        .post
        .file_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| DownloadError::validation(&ctx.post_id, "missing file_url"))?
        .to_string();
    if !ctx.validator.validate(&url) {
        return Err(DownloadError::validation(&ctx.post_id, "file_url rejected by validator"));
    }

    // Plan
    let target = plan_target(&ctx.post, &ctx.base_dir)?;
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        debug!(post_id = %ctx.post_id, path = %target.display(), "final file already present");
        return Ok(target);
    }
    let tmp = tmp_path(&target);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent.to_path_buf(), e))?;
    }

    // Attempt loop
    let policy = super::retry::RetryPolicy::new(ctx.settings.max_retries, ctx.settings.retry_delay);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        ctx.check_cancelled()?;

        match run_attempt(ctx, &url, &target, &tmp).await {
            Ok(()) => return Ok(target),
            Err(err) => {
                let failure = super::retry::classify_error(&err);
                match policy.should_retry(failure, attempt) {
                    super::retry::RetryDecision::Retry { delay, attempt: next } => {
                        warn!(
                            post_id = %ctx.post_id,
                            attempt,
                            next_attempt = next,
                            delay_ms = delay.as_millis(),
                            error = %err,
                            "attempt failed, retrying"
                        );
                        sleep_cancellable(ctx, delay).await?;
                    }
                    super::retry::RetryDecision::DoNotRetry { reason } => {
                        debug!(post_id = %ctx.post_id, attempt, %reason, "giving up");
                        return Err(if attempt > 1 && failure == super::retry::FailureType::Transient {
                            DownloadError::RetriesExhausted {
                                attempts: attempt,
                                last_error: err.to_string(),
                            }
                        } else {
                            err
                        });
                    }
                }
            }
        }
    }
}

/// One request/stream/verify/finalize cycle.
async fn run_attempt(
    ctx: &TransferContext,
    url: &str,
    target: &Path,
    tmp: &Path,
) -> Result<(), DownloadError> {
    // PrepareResume
    let existing = tokio::fs::metadata(tmp).await.map(|m| m.len()).unwrap_or(0);
    let range = (existing > 0).then(|| format!("bytes={existing}-"));
    if existing > 0 {
        info!(
            post_id = %ctx.post_id,
            resume_from = existing,
            "resuming from partial file"
        );
    }

    // Request
    let timeout = ctx.settings.timeout;
    let mut response = ctx.session.get_asset(url, range, timeout).await?;
    let mut already_on_disk = existing;

    let mut status = response.status().as_u16();
    if status == 416 {
        if existing > 0 {
            // The partial already covers the whole asset.
            tokio::fs::rename(tmp, target)
                .await
                .map_err(|e| DownloadError::io(target.to_path_buf(), e))?;
            info!(post_id = %ctx.post_id, "partial file was already complete");
            ctx.report_progress(100.0);
            return Ok(());
        }
        // An empty tmp with a refused range: reissue as a plain 200.
        response = ctx.session.get_asset(url, None, timeout).await?;
        status = response.status().as_u16();
        already_on_disk = 0;
    }

    let append = match status {
        206 => true,
        200 => {
            already_on_disk = 0;
            false
        }
        300..=399 => return Err(DownloadError::redirect(url, status)),
        other => return Err(DownloadError::http_status(url, other)),
    };

    let declared = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let expected_total = declared.map(|len| already_on_disk + len);

    if let Some(total) = expected_total {
        check_disk_guard(&ctx.settings, &ctx.base_dir, total)?;
    }

    // Stream
    let file = if append {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(tmp)
            .await
    } else {
        tokio::fs::File::create(tmp).await
    }
    .map_err(|e| DownloadError::io(tmp.to_path_buf(), e))?;
    let mut writer = BufWriter::with_capacity(ctx.settings.chunk_size, file);

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut last_progress = Instant::now() - PROGRESS_INTERVAL;

    while let Some(chunk) = stream.next().await {
        if ctx.token.is_cancelled() || ctx.shutdown.is_cancelled() {
            // Flush what arrived so the partial is resumable, then stop.
            let _ = writer.flush().await;
            return Err(DownloadError::cancelled(
                ctx.token.reason().or_else(|| ctx.shutdown.reason()),
            ));
        }

        let chunk = chunk.map_err(|e| {
            DownloadError::Session(SessionError::Network {
                url: url.to_string(),
                source: e,
            })
        })?;
        if chunk.is_empty() {
            continue;
        }

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(tmp.to_path_buf(), e))?;
        written += chunk.len() as u64;

        if let Some(total) = expected_total {
            if already_on_disk + written > total + OVERRUN_SLACK {
                let _ = writer.flush().await;
                // The oversized partial is preserved for inspection.
                return Err(DownloadError::integrity(
                    tmp.to_path_buf(),
                    total,
                    already_on_disk + written,
                ));
            }

            if total > 0 && last_progress.elapsed() >= PROGRESS_INTERVAL {
                let percent = ((already_on_disk + written) as f64 / total as f64) * 100.0;
                ctx.report_progress(percent.min(99.9));
                last_progress = Instant::now();
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(tmp.to_path_buf(), e))?;
    drop(writer);

    // Verify
    let final_size = tokio::fs::metadata(tmp)
        .await
        .map(|m| m.len())
        .map_err(|e| DownloadError::io(tmp.to_path_buf(), e))?;
    if let Some(total) = expected_total {
        if final_size < total {
            return Err(DownloadError::integrity(tmp.to_path_buf(), total, final_size));
        }
    }

    // Finalize
    tokio::fs::rename(tmp, target)
        .await
        .map_err(|e| DownloadError::io(target.to_path_buf(), e))?;
    ctx.report_progress(100.0);
    info!(
        post_id = %ctx.post_id,
        path = %target.display(),
        bytes = final_size,
        resumed = already_on_disk > 0,
        "download complete"
    );
    Ok(())
}

/// Computes the library path `{base}/{folder}/{id}_{tags}{ext}`.
pub(crate) fn plan_target(post: &Post, base_dir: &Path) -> Result<PathBuf, DownloadError> {
    let folder = post.rating.folder_name();
    let url = post.file_url.as_deref().unwrap_or("");
    let ext = extension_from_url(url);

    let tags: String = post
        .tags
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .take(MAX_TAG_LEN)
        .collect();
    let filename = format!("{}_{}{}", post.id, tags.replace(' ', "_"), ext);
    let safe = security::sanitize_filename(&filename, MAX_FILENAME_LEN);

    security::join_under(base_dir, &[folder, &safe])
        .map_err(|e| DownloadError::validation(post.key(), e.to_string()))
}

/// `{target}.tmp` - the partial lives next to the final file.
pub(crate) fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    target.with_file_name(name)
}

fn extension_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let last = path.rsplit('/').next().unwrap_or("");
    match last.rfind('.') {
        Some(dot) if dot + 1 < last.len() && last.len() - dot <= 6 => last[dot..].to_ascii_lowercase(),
        _ => ".jpg".to_string(),
    }
}

/// Checks free space and the per-file ceiling before streaming starts.
fn check_disk_guard(
    settings: &DownloaderSettings,
    base_dir: &Path,
    expected_total: u64,
) -> Result<(), DownloadError> {
    if expected_total > settings.max_file_bytes {
        return Err(DownloadError::disk_guard(format!(
            "expected size {expected_total} exceeds limit {}",
            settings.max_file_bytes
        )));
    }

    match fs2::available_space(base_dir) {
        Ok(free) => {
            if free < settings.disk_min_free_bytes {
                return Err(DownloadError::disk_guard(format!(
                    "free space {free} below minimum {}",
                    settings.disk_min_free_bytes
                )));
            }
        }
        Err(err) => {
            // An unreadable volume is treated as a guard failure rather than
            // a green light.
            return Err(DownloadError::disk_guard(format!(
                "free-space probe failed: {err}"
            )));
        }
    }
    Ok(())
}

/// Sleeps the backoff delay, aborting early on cancellation.
async fn sleep_cancellable(ctx: &TransferContext, delay: Duration) -> Result<(), DownloadError> {
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = ctx.token.cancelled() => Err(DownloadError::cancelled(ctx.token.reason())),
        () = ctx.shutdown.cancelled() => Err(DownloadError::cancelled(ctx.shutdown.reason())),
    }
}
