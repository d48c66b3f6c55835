//! Priority-driven preloader that warms the image cache.
//!
//! Posts are queued at one of three priorities into a min-heap keyed by
//! `(priority, insertion_seq)`. A single scheduler task owns the heap and
//! hands work to a semaphore-bounded worker pool; workers fetch the post's
//! preview asset, decode it, downscale oversized images, and insert into
//! the shared LRU. Failed fetches are retried by delayed reinsertion at a
//! demoted priority.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CachedImage, ImageCache};
use crate::cancel::CancellationToken;
use crate::events::{Event, EventBus, EventKind};
use crate::post::Post;
use crate::security::UrlValidator;
use crate::session::{Session, SessionError};

/// Posts near the current view.
pub const PRIORITY_IMMEDIATE: u8 = 0;

/// The likely-next window.
pub const PRIORITY_NEXT_PAGE: u8 = 10;

/// Background fill.
pub const PRIORITY_PREFETCH: u8 = 50;

/// Demoted priority used for retry reinsertion.
const PRIORITY_RETRY: u8 = PRIORITY_PREFETCH + 10;

/// Delay before a failed fetch is reinserted.
const RETRY_REINSERT_DELAY: Duration = Duration::from_secs(2);

/// Default retry budget for non-permanent failures.
pub const DEFAULT_PRELOAD_RETRIES: u32 = 2;

/// Images whose longer side exceeds this are downscaled to fit.
const MAX_DIMENSION: u32 = 2000;

/// Outcome delivered to `on_failed` when a post cannot be preloaded.
#[derive(Debug, Clone)]
pub struct PreloadResult {
    /// Asset id.
    pub post_id: String,
    /// Always `false` for `on_failed` deliveries.
    pub success: bool,
    /// Classified error message.
    pub error: Option<String>,
    /// Retries consumed before giving up.
    pub retry_count: u32,
    /// Wall time spent on the final attempt.
    pub load_time: Duration,
}

/// Callback invoked on permanent or retry-exhausted failures.
pub type FailedCallback = Arc<dyn Fn(&PreloadResult) + Send + Sync>;

/// Preloader tuning.
#[derive(Clone)]
pub struct PreloaderOptions {
    /// Worker pool size.
    pub workers: usize,
    /// Retry budget for non-permanent failures.
    pub max_retries: u32,
    /// Per-fetch timeout.
    pub timeout: Duration,
    /// Failure callback.
    pub on_failed: Option<FailedCallback>,
}

impl Default for PreloaderOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            max_retries: DEFAULT_PRELOAD_RETRIES,
            timeout: Duration::from_secs(15),
            on_failed: None,
        }
    }
}

impl std::fmt::Debug for PreloaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloaderOptions")
            .field("workers", &self.workers)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

/// Counts returned by the enqueue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueStats {
    /// Newly queued posts.
    pub queued: usize,
    /// Posts skipped because they were cached, pending, or in flight.
    pub skipped: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: u8,
    seq: u64,
    post_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PendingEntry {
    post: Post,
    priority: u8,
    seq: u64,
}

#[derive(Default)]
struct PreloadState {
    /// Min-heap over (priority, seq). Entries may be stale; each pop is
    /// validated against `pending`.
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Every heap entry has a pending entry; a pending entry without a heap
    /// entry belongs to a worker that already popped it.
    pending: HashMap<String, PendingEntry>,
    in_progress: HashMap<String, CancellationToken>,
    retries: HashMap<String, u32>,
}

struct PreloaderInner {
    cache: Arc<ImageCache>,
    session: Arc<Session>,
    validator: Arc<UrlValidator>,
    bus: EventBus,
    options: PreloaderOptions,
    state: Mutex<PreloadState>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    seq: AtomicU64,
}

enum FetchOutcome {
    Loaded,
    AlreadyCached,
}

enum FetchFailure {
    Cancelled,
    Permanent(String),
    Retryable(String),
}

/// Preloader over a shared cache, session, and validator.
///
/// Construction spawns the scheduler task, so a Tokio runtime must be
/// current. Clones share all state.
#[derive(Clone)]
pub struct Preloader {
    inner: Arc<PreloaderInner>,
}

impl std::fmt::Debug for Preloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloader")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Preloader {
    /// Creates the preloader and starts its scheduler task.
    #[must_use]
    pub fn new(
        cache: Arc<ImageCache>,
        session: Arc<Session>,
        validator: Arc<UrlValidator>,
        bus: EventBus,
        options: PreloaderOptions,
    ) -> Self {
        let workers = options.workers.max(1);
        let inner = Arc::new(PreloaderInner {
            cache,
            session,
            validator,
            bus,
            semaphore: Arc::new(Semaphore::new(workers)),
            options,
            state: Mutex::new(PreloadState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
        });

        let scheduler = Arc::clone(&inner);
        tokio::spawn(async move {
            scheduler_loop(scheduler).await;
        });

        Self { inner }
    }

    /// Queues posts at the highest priority.
    pub fn preload_immediate(&self, posts: Vec<Post>) -> EnqueueStats {
        self.enqueue(posts, PRIORITY_IMMEDIATE)
    }

    /// Queues the likely-next window.
    pub fn preload_next_page(&self, posts: Vec<Post>) -> EnqueueStats {
        self.enqueue(posts, PRIORITY_NEXT_PAGE)
    }

    /// Queues background fill.
    pub fn preload_batch(&self, posts: Vec<Post>) -> EnqueueStats {
        self.enqueue(posts, PRIORITY_PREFETCH)
    }

    fn enqueue(&self, posts: Vec<Post>, priority: u8) -> EnqueueStats {
        let mut stats = EnqueueStats::default();
        {
            let mut state = self.inner.lock_state();
            for post in posts {
                let post_id = post.key();
                if self.inner.cache.has(&post_id)
                    || state.pending.contains_key(&post_id)
                    || state.in_progress.contains_key(&post_id)
                {
                    stats.skipped += 1;
                    continue;
                }
                let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                state.heap.push(Reverse(HeapEntry {
                    priority,
                    seq,
                    post_id: post_id.clone(),
                }));
                state.pending.insert(
                    post_id,
                    PendingEntry {
                        post,
                        priority,
                        seq,
                    },
                );
                stats.queued += 1;
            }
        }
        if stats.queued > 0 {
            self.inner.notify.notify_one();
        }
        debug!(queued = stats.queued, skipped = stats.skipped, priority, "batch enqueued");
        stats
    }

    /// Promotes a still-pending post to IMMEDIATE priority.
    ///
    /// Returns whether a change occurred.
    pub fn boost_priority(&self, post_id: &str) -> bool {
        let boosted = {
            let mut state = self.inner.lock_state();
            if state.in_progress.contains_key(post_id) {
                false
            } else if let Some(entry) = state.pending.get_mut(post_id) {
                if entry.priority > PRIORITY_IMMEDIATE {
                    entry.priority = PRIORITY_IMMEDIATE;
                    entry.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                    let (priority, seq) = (entry.priority, entry.seq);
                    // The old heap entry goes stale; pops validate against
                    // `pending` and discard it.
                    state.heap.push(Reverse(HeapEntry {
                        priority,
                        seq,
                        post_id: post_id.to_string(),
                    }));
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if boosted {
            self.inner.notify.notify_one();
            debug!(post_id, "priority boosted");
        }
        boosted
    }

    /// Cancels a pending or in-flight preload.
    ///
    /// Returns whether anything was cancelled.
    pub fn cancel(&self, post_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let mut hit = state.pending.remove(post_id).is_some();
        if let Some(token) = state.in_progress.get(post_id) {
            token.cancel("preload cancelled");
            hit = true;
        }
        hit
    }

    /// Drops every queued post. In-flight fetches keep running.
    pub fn clear_pending(&self) {
        let mut state = self.inner.lock_state();
        let in_progress: Vec<String> = state.in_progress.keys().cloned().collect();
        state.pending.retain(|id, _| in_progress.contains(id));
        state.heap.clear();
        state.retries.clear();
        debug!("pending queue cleared");
    }

    /// Queued posts not yet picked up by a worker.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let state = self.inner.lock_state();
        state.pending.len() - state.in_progress.len().min(state.pending.len())
    }

    /// Posts currently being fetched.
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.inner.lock_state().in_progress.len()
    }

    /// Stops the scheduler, cancels in-flight fetches, and (optionally)
    /// waits briefly for workers to drain.
    pub async fn shutdown(&self, wait: bool) {
        self.inner.shutdown.cancel("preloader shutdown");
        self.inner.notify.notify_waiters();
        {
            let state = self.inner.lock_state();
            for token in state.in_progress.values() {
                token.cancel("preloader shutdown");
            }
        }
        if wait {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.in_progress_count() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        info!("preloader shut down");
    }

    /// Test hook: pops the next valid entry the way the scheduler would.
    #[cfg(test)]
    pub(crate) fn test_pop_next(&self) -> Option<String> {
        self.inner.pop_valid().map(|(post_id, _, _)| post_id)
    }
}

impl PreloaderInner {
    fn lock_state(&self) -> MutexGuard<'_, PreloadState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pops heap entries until one matches its pending record, marking it
    /// in-progress. Stale entries (cancelled or re-prioritised) are
    /// discarded.
    fn pop_valid(&self) -> Option<(String, Post, CancellationToken)> {
        let mut state = self.lock_state();
        while let Some(Reverse(entry)) = state.heap.pop() {
            let Some(pending) = state.pending.get(&entry.post_id) else {
                continue;
            };
            if pending.priority != entry.priority || pending.seq != entry.seq {
                continue;
            }
            if state.in_progress.contains_key(&entry.post_id) {
                continue;
            }
            let post = pending.post.clone();
            let token = CancellationToken::new();
            state.in_progress.insert(entry.post_id.clone(), token.clone());
            return Some((entry.post_id, post, token));
        }
        None
    }
}

/// The scheduler: pops work, bounds it with the semaphore, spawns workers.
async fn scheduler_loop(inner: Arc<PreloaderInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        match inner.pop_valid() {
            Some((post_id, post, token)) => {
                let permit = tokio::select! {
                    permit = Arc::clone(&inner.semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    () = inner.shutdown.cancelled() => break,
                };
                let worker_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    run_worker(worker_inner, post_id, post, token, permit).await;
                });
            }
            None => {
                tokio::select! {
                    () = inner.notify.notified() => {}
                    () = inner.shutdown.cancelled() => break,
                }
            }
        }
    }
    debug!("preloader scheduler exited");
}

async fn run_worker(
    inner: Arc<PreloaderInner>,
    post_id: String,
    post: Post,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let outcome = fetch_and_cache(&inner, &post_id, &post, &token).await;
    let load_time = started.elapsed();

    match outcome {
        Ok(FetchOutcome::Loaded) => {
            let mut state = inner.lock_state();
            state.in_progress.remove(&post_id);
            state.pending.remove(&post_id);
            state.retries.remove(&post_id);
            drop(state);
            inner.bus.publish(
                &Event::new(EventKind::ImagePreloaded)
                    .with("post_id", post_id.clone())
                    .with("load_ms", load_time.as_millis() as u64),
            );
            inner.notify.notify_one();
        }
        Ok(FetchOutcome::AlreadyCached) => {
            let mut state = inner.lock_state();
            state.in_progress.remove(&post_id);
            state.pending.remove(&post_id);
            drop(state);
            inner.notify.notify_one();
        }
        Err(FetchFailure::Cancelled) => {
            let mut state = inner.lock_state();
            state.in_progress.remove(&post_id);
            state.pending.remove(&post_id);
            drop(state);
            debug!(post_id = %post_id, "preload cancelled");
            inner.notify.notify_one();
        }
        Err(FetchFailure::Permanent(message)) => {
            finish_failed(&inner, &post_id, message, load_time);
        }
        Err(FetchFailure::Retryable(message)) => {
            let retry_count = {
                let mut state = inner.lock_state();
                state.in_progress.remove(&post_id);
                let count = state.retries.entry(post_id.clone()).or_insert(0);
                *count += 1;
                *count
            };

            if retry_count <= inner.options.max_retries && !inner.shutdown.is_cancelled() {
                warn!(
                    post_id = %post_id,
                    retry_count,
                    error = %message,
                    "preload failed, scheduling demoted retry"
                );
                schedule_retry(&inner, &post_id);
            } else {
                finish_failed(&inner, &post_id, message, load_time);
            }
        }
    }
}

/// Reinserts a failed post at the demoted retry priority after a delay.
fn schedule_retry(inner: &Arc<PreloaderInner>, post_id: &str) {
    let inner = Arc::clone(inner);
    let post_id = post_id.to_string();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(RETRY_REINSERT_DELAY) => {}
            () = inner.shutdown.cancelled() => return,
        }
        let reinserted = {
            let mut state = inner.lock_state();
            if state.in_progress.contains_key(&post_id) {
                false
            } else if let Some(entry) = state.pending.get_mut(&post_id) {
                entry.priority = PRIORITY_RETRY;
                entry.seq = inner.seq.fetch_add(1, Ordering::Relaxed);
                let (priority, seq) = (entry.priority, entry.seq);
                state.heap.push(Reverse(HeapEntry {
                    priority,
                    seq,
                    post_id: post_id.clone(),
                }));
                true
            } else {
                // Cancelled or cleared while waiting.
                false
            }
        };
        if reinserted {
            inner.notify.notify_one();
        }
    });
}

fn finish_failed(inner: &Arc<PreloaderInner>, post_id: &str, message: String, load_time: Duration) {
    let retry_count = {
        let mut state = inner.lock_state();
        state.in_progress.remove(post_id);
        state.pending.remove(post_id);
        state.retries.remove(post_id).unwrap_or(0)
    };

    warn!(post_id, error = %message, retry_count, "preload failed terminally");
    inner.bus.publish(
        &Event::new(EventKind::ImageFailed)
            .with("post_id", post_id.to_string())
            .with("error", message.clone()),
    );

    if let Some(on_failed) = &inner.options.on_failed {
        let result = PreloadResult {
            post_id: post_id.to_string(),
            success: false,
            error: Some(message),
            retry_count,
            load_time,
        };
        let on_failed = Arc::clone(on_failed);
        if catch_unwind(AssertUnwindSafe(|| on_failed(&result))).is_err() {
            warn!(post_id, "preload failure callback panicked");
        }
    }
    inner.notify.notify_one();
}

/// Fetch, decode, downscale, insert. Checked for cancellation at every
/// suspension point.
async fn fetch_and_cache(
    inner: &Arc<PreloaderInner>,
    post_id: &str,
    post: &Post,
    token: &CancellationToken,
) -> Result<FetchOutcome, FetchFailure> {
    if inner.cache.has(post_id) {
        return Ok(FetchOutcome::AlreadyCached);
    }

    let url = post
        .preload_url()
        .ok_or_else(|| FetchFailure::Permanent("no preview URL".to_string()))?
        .to_string();
    if !inner.validator.validate(&url) {
        return Err(FetchFailure::Permanent("preview URL rejected".to_string()));
    }

    check_cancel(inner, token)?;

    let response = inner
        .session
        .get_asset(&url, None, inner.options.timeout)
        .await
        .map_err(|e| match e {
            SessionError::Closed => FetchFailure::Cancelled,
            other => FetchFailure::Retryable(other.to_string()),
        })?;

    let status = response.status().as_u16();
    match status {
        200 => {}
        404 => return Err(FetchFailure::Permanent(format!("HTTP 404 for {url}"))),
        other => return Err(FetchFailure::Retryable(format!("HTTP {other} for {url}"))),
    }

    check_cancel(inner, token)?;

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchFailure::Retryable(format!("body read failed: {e}")))?;

    check_cancel(inner, token)?;

    // Decode and resize are CPU-bound; keep them off the async workers.
    let decoded = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| FetchFailure::Permanent(format!("decode failed: {e}")))?;
        let image = if image.width().max(image.height()) > MAX_DIMENSION {
            image.resize(
                MAX_DIMENSION,
                MAX_DIMENSION,
                image::imageops::FilterType::Lanczos3,
            )
        } else {
            image
        };
        Ok(image)
    })
    .await
    .map_err(|e| FetchFailure::Retryable(format!("decode task failed: {e}")))??;

    // A cancellation observed here must not populate the cache.
    check_cancel(inner, token)?;

    inner.cache.put(post_id, CachedImage::new(decoded));
    Ok(FetchOutcome::Loaded)
}

fn check_cancel(inner: &Arc<PreloaderInner>, token: &CancellationToken) -> Result<(), FetchFailure> {
    if token.is_cancelled() || inner.shutdown.is_cancelled() {
        return Err(FetchFailure::Cancelled);
    }
    Ok(())
}
